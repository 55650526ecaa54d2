use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use segue::WaveformBuffer;

#[cfg(target_endian = "little")]
const RAW_FORMAT: &str = "f32le";
#[cfg(target_endian = "big")]
const RAW_FORMAT: &str = "f32be";

/// Frames written to ffmpeg per pipe write.
const WRITE_CHUNK_FRAMES: usize = 65536;

pub struct FfmpegEncoder {
    child: Child,
}

fn build_args(output_path: &Path, sample_rate: u32, channels: usize, codec: Option<&str>, bitrate: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-f".into(), RAW_FORMAT.into(),
        "-ar".into(), sample_rate.to_string(),
        "-ac".into(), channels.to_string(),
        "-i".into(), "pipe:0".into(),
    ];
    // Without an explicit codec ffmpeg picks one from the output extension.
    if let Some(codec) = codec {
        args.extend(["-c:a".to_string(), codec.to_string()]);
    }
    if let Some(br) = bitrate {
        args.extend(["-b:a".to_string(), br.to_string()]);
    }
    args.push(output_path.to_string_lossy().into_owned());
    args
}

impl FfmpegEncoder {
    pub fn new(
        output_path: &Path,
        sample_rate: u32,
        channels: usize,
        codec: Option<&str>,
        bitrate: Option<&str>,
    ) -> Result<Self> {
        let args = build_args(output_path, sample_rate, channels, codec, bitrate);

        let child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn ffmpeg. Is ffmpeg installed?")?;

        log::info!(
            "FFmpeg encoder started: {}Hz, {} ch -> {}",
            sample_rate,
            channels,
            output_path.display()
        );

        Ok(Self { child })
    }

    /// Writes interleaved samples.
    pub fn write_samples(&mut self, interleaved: &[f32]) -> Result<()> {
        let stdin = self.child.stdin.as_mut().context("FFmpeg stdin not available")?;
        stdin
            .write_all(bytemuck::cast_slice(interleaved))
            .context("Failed to write samples to ffmpeg")?;
        Ok(())
    }

    pub fn write_buffer(&mut self, buffer: &WaveformBuffer, mut on_progress: impl FnMut(usize)) -> Result<()> {
        let channels = buffer.channel_count();
        let interleaved = buffer.to_interleaved();
        for (i, chunk) in interleaved.chunks(WRITE_CHUNK_FRAMES * channels).enumerate() {
            self.write_samples(chunk)?;
            on_progress(((i + 1) * WRITE_CHUNK_FRAMES).min(buffer.frames()));
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        // Close stdin to signal EOF
        drop(self.child.stdin.take());

        let output = self.child.wait_with_output().context("Failed to wait for ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("FFmpeg exited with error:\n{}", stderr);
        }

        log::info!("FFmpeg encoding complete");
        Ok(())
    }
}

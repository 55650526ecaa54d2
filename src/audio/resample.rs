//! Sample-rate conversion with rubato.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use super::buffer::WaveformBuffer;
use crate::error::{AnalysisError, Result};

/// Converts `buffer` to `target_rate`, returning it untouched when the rates already match.
///
/// The output holds exactly `round(frames * target_rate / source_rate)` frames.
pub fn resample_to(buffer: WaveformBuffer, target_rate: u32) -> Result<WaveformBuffer> {
    let source_rate = buffer.sample_rate();
    if source_rate == target_rate {
        log::debug!("Sample rate already at {}Hz, skipping resample", target_rate);
        return Ok(buffer);
    }
    if target_rate == 0 {
        return Err(AnalysisError::InvalidParameter("target sample rate must be non-zero".into()));
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let input_frames = buffer.frames();
    let expected = (input_frames as f64 * ratio).round() as usize;
    let channels = buffer.channel_count();

    log::debug!(
        "Resampling {} frames from {}Hz to {}Hz ({} channels)",
        input_frames, source_rate, target_rate, channels
    );

    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        channels,
    )
    .map_err(|e| AnalysisError::UnsupportedInput(format!("failed to create resampler: {e}")))?;

    let mut planar = resampler
        .process(buffer.channels(), None)
        .map_err(|e| AnalysisError::UnsupportedInput(format!("resampling failed: {e}")))?;

    for ch in &mut planar {
        ch.resize(expected, 0.0);
    }

    Ok(WaveformBuffer::from_planar(target_rate, planar))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_same_rate_is_identity() {
        let buf = WaveformBuffer::from_mono(44100, vec![0.1, 0.2, 0.3]).unwrap();
        let out = resample_to(buf.clone(), 44100).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn test_resample_length_and_rate() {
        let samples: Vec<f32> = (0..48000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let buf = WaveformBuffer::new(48000, vec![samples.clone(), samples]).unwrap();
        let out = resample_to(buf, 44100).unwrap();
        assert_eq!(out.sample_rate(), 44100);
        assert_eq!(out.frames(), 44100);
        assert_eq!(out.channel_count(), 2);
    }
}

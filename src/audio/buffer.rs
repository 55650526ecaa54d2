use crate::error::{AnalysisError, Result};

pub const MAX_CHANNELS: usize = 2;

/// Decoded PCM audio held as planar `f32` channels.
///
/// Buffers built through the public constructors are validated: a non-zero sample rate,
/// one or two channels of equal non-zero length, and only finite samples. Stage outputs are
/// produced internally and follow the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl WaveformBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AnalysisError::UnsupportedInput("sample rate must be non-zero".into()));
        }
        if channels.is_empty() || channels.len() > MAX_CHANNELS {
            return Err(AnalysisError::UnsupportedInput(format!(
                "{} channels (only mono and stereo are supported)",
                channels.len()
            )));
        }
        let frames = channels[0].len();
        if frames == 0 {
            return Err(AnalysisError::UnsupportedInput("buffer contains no samples".into()));
        }
        if channels.iter().any(|c| c.len() != frames) {
            return Err(AnalysisError::UnsupportedInput("channels differ in length".into()));
        }
        if channels.iter().flatten().any(|s| !s.is_finite()) {
            return Err(AnalysisError::UnsupportedInput("buffer contains non-finite samples".into()));
        }
        Ok(Self { sample_rate, channels })
    }

    pub fn from_mono(sample_rate: u32, samples: Vec<f32>) -> Result<Self> {
        Self::new(sample_rate, vec![samples])
    }

    pub fn from_interleaved(samples: &[f32], sample_rate: u32, channel_count: usize) -> Result<Self> {
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(AnalysisError::UnsupportedInput(format!(
                "{} channels (only mono and stereo are supported)",
                channel_count
            )));
        }
        if samples.len() % channel_count != 0 {
            return Err(AnalysisError::UnsupportedInput(
                "interleaved sample count is not a multiple of the channel count".into(),
            ));
        }
        let frames = samples.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in samples.chunks_exact(channel_count) {
            for (ch, &s) in frame.iter().enumerate() {
                channels[ch].push(s);
            }
        }
        Self::new(sample_rate, channels)
    }

    /// Internal constructor for stage outputs; the caller guarantees the layout.
    pub(crate) fn from_planar(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        debug_assert!(!channels.is_empty() && channels.len() <= MAX_CHANNELS);
        debug_assert!(channels.iter().all(|c| c.len() == channels[0].len()));
        Self { sample_rate, channels }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }

    /// Converts a time offset into a frame index at this buffer's rate.
    pub fn frames_for_secs(&self, secs: f64) -> usize {
        (secs.max(0.0) * self.sample_rate as f64).round() as usize
    }

    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels.len() == 1 {
            return self.channels[0].clone();
        }
        let scale = 1.0 / self.channels.len() as f32;
        (0..self.frames())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() * scale)
            .collect()
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let n = self.channel_count();
        let mut out = Vec::with_capacity(self.frames() * n);
        for i in 0..self.frames() {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }

    /// Copies frames `[start, end)`, clamped to the buffer.
    pub fn slice(&self, start: usize, end: usize) -> WaveformBuffer {
        let end = end.min(self.frames());
        let start = start.min(end);
        let channels = self.channels.iter().map(|c| c[start..end].to_vec()).collect();
        Self::from_planar(self.sample_rate, channels)
    }

    pub fn truncated(mut self, frames: usize) -> WaveformBuffer {
        for ch in &mut self.channels {
            ch.truncate(frames);
        }
        self
    }

    pub fn with_leading_silence(mut self, frames: usize) -> WaveformBuffer {
        if frames == 0 {
            return self;
        }
        for ch in &mut self.channels {
            let mut padded = vec![0.0; frames];
            padded.extend_from_slice(ch);
            *ch = padded;
        }
        self
    }

    /// Up-mixes mono by duplication or down-mixes stereo by averaging.
    pub fn with_channel_count(self, count: usize) -> WaveformBuffer {
        match (self.channel_count(), count) {
            (from, to) if from == to => self,
            (1, 2) => {
                let mono = self.channels.into_iter().next().unwrap_or_default();
                Self::from_planar(self.sample_rate, vec![mono.clone(), mono])
            }
            _ => {
                let rate = self.sample_rate;
                Self::from_planar(rate, vec![self.to_mono()])
            }
        }
    }

    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flatten()
            .fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    pub fn rms(&self) -> f32 {
        let total = self.frames() * self.channel_count();
        if total == 0 {
            return 0.0;
        }
        let sum_sq: f64 = self.channels.iter().flatten().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / total as f64).sqrt() as f32
    }

    pub fn apply_gain(&mut self, gain: f32) {
        for s in self.channels.iter_mut().flatten() {
            *s *= gain;
        }
    }

    /// RMS-normalises to `target_rms_db` dBFS, scaling down further if the peak would pass 0.99.
    pub fn normalize_loudness(&mut self, target_rms_db: f32) -> f32 {
        let rms = self.rms();
        if rms <= f32::EPSILON {
            return 1.0;
        }
        let target = 10.0_f32.powf(target_rms_db / 20.0);
        let mut gain = target / rms;
        let peak = self.peak() * gain;
        if peak > 0.99 {
            gain *= 0.99 / peak;
        }
        self.apply_gain(gain);
        log::debug!("Loudness normalised: rms {:.4} -> {:.4}, gain {:.3}", rms, rms * gain, gain);
        gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_layouts() {
        assert!(matches!(
            WaveformBuffer::new(0, vec![vec![0.0; 4]]),
            Err(AnalysisError::UnsupportedInput(_))
        ));
        assert!(WaveformBuffer::new(44100, vec![]).is_err());
        assert!(WaveformBuffer::new(44100, vec![vec![0.0; 4]; 3]).is_err());
        assert!(WaveformBuffer::new(44100, vec![vec![0.0; 4], vec![0.0; 3]]).is_err());
        assert!(WaveformBuffer::new(44100, vec![vec![]]).is_err());
        assert!(WaveformBuffer::new(44100, vec![vec![0.0, f32::NAN]]).is_err());
    }

    #[test]
    fn test_interleaved_round_trip() {
        let interleaved = vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let buf = WaveformBuffer::from_interleaved(&interleaved, 48000, 2).unwrap();
        assert_eq!(buf.frames(), 3);
        assert_eq!(buf.channel(1), &[-0.1, -0.2, -0.3]);
        assert_eq!(buf.to_interleaved(), interleaved);
        assert!(WaveformBuffer::from_interleaved(&interleaved[..5], 48000, 2).is_err());
    }

    #[test]
    fn test_channel_conversion_and_slicing() {
        let mono = WaveformBuffer::from_mono(8000, vec![0.5; 8000]).unwrap();
        let stereo = mono.clone().with_channel_count(2);
        assert_eq!(stereo.channel_count(), 2);
        assert_eq!(stereo.channel(0), stereo.channel(1));
        assert_eq!(stereo.with_channel_count(1), mono);

        let part = mono.slice(2000, 99_999);
        assert_eq!(part.frames(), 6000);
        assert!((part.duration_secs() - 0.75).abs() < 1e-9);

        let padded = part.with_leading_silence(100);
        assert_eq!(padded.frames(), 6100);
        assert_eq!(padded.channel(0)[99], 0.0);
        assert_eq!(padded.channel(0)[100], 0.5);
    }

    #[test]
    fn test_normalize_respects_peak_ceiling() {
        let mut samples = vec![0.01_f32; 44100];
        samples[100] = 0.9;
        let mut buf = WaveformBuffer::from_mono(44100, samples).unwrap();
        buf.normalize_loudness(-6.0);
        assert!(buf.peak() <= 0.99 + 1e-6, "peak {} exceeds ceiling", buf.peak());
    }
}

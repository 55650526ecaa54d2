//! Deterministic synthetic signals for unit tests.

use std::f32::consts::PI;

use crate::audio::WaveformBuffer;

/// Small LCG so test noise is reproducible without a rand dependency.
pub struct Noise(u64);

impl Noise {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1))
    }

    pub fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
    }
}

/// Noise-burst clicks at `offset + k * 60 / bpm`, every fourth one accented.
pub fn click_samples(sample_rate: u32, bpm: f64, secs: f64, offset: f64) -> Vec<f32> {
    let n = (sample_rate as f64 * secs) as usize;
    let mut out = vec![0.0f32; n];
    let mut noise = Noise::new(7);
    let period = 60.0 / bpm;
    let burst = (sample_rate as f64 * 0.04) as usize;
    let tau = sample_rate as f32 * 0.01;

    let mut k = 0usize;
    loop {
        let t = offset + k as f64 * period;
        let start = (t * sample_rate as f64).round() as usize;
        if start >= n {
            break;
        }
        let amp = if k % 4 == 0 { 0.8 } else { 0.4 };
        for i in 0..burst.min(n - start) {
            out[start + i] += amp * (-(i as f32) / tau).exp() * noise.next();
        }
        k += 1;
    }
    out
}

pub fn click_track(sample_rate: u32, bpm: f64, secs: f64, offset: f64) -> WaveformBuffer {
    WaveformBuffer::from_mono(sample_rate, click_samples(sample_rate, bpm, secs, offset)).unwrap()
}

pub fn tone_samples(sample_rate: u32, secs: f64, freqs: &[f32], amp: f32) -> Vec<f32> {
    let n = (sample_rate as f64 * secs) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            freqs.iter().map(|f| amp * (2.0 * PI * f * t).sin()).sum()
        })
        .collect()
}

pub fn tones(sample_rate: u32, secs: f64, freqs: &[f32], amp: f32) -> WaveformBuffer {
    WaveformBuffer::from_mono(sample_rate, tone_samples(sample_rate, secs, freqs, amp)).unwrap()
}

pub fn silence(sample_rate: u32, secs: f64) -> WaveformBuffer {
    WaveformBuffer::from_mono(sample_rate, vec![0.0; (sample_rate as f64 * secs) as usize]).unwrap()
}

pub const A_MINOR_TRIAD: [f32; 3] = [220.0, 261.63, 329.63];
pub const C_MAJOR_TRIAD: [f32; 3] = [261.63, 329.63, 392.0];

/// Clicks over a sustained A minor pad.
pub fn a_minor_groove(sample_rate: u32, bpm: f64, secs: f64) -> WaveformBuffer {
    let clicks = click_samples(sample_rate, bpm, secs, 0.0);
    let pad = tone_samples(sample_rate, secs, &A_MINOR_TRIAD, 0.12);
    let mixed = clicks.iter().zip(&pad).map(|(c, p)| c + p).collect();
    WaveformBuffer::from_mono(sample_rate, mixed).unwrap()
}

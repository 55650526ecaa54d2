#![allow(dead_code)]

use std::f32::consts::PI;

use segue::WaveformBuffer;

pub const A_MINOR_TRIAD: [f32; 3] = [220.0, 261.63, 329.63];

struct Noise(u64);

impl Noise {
    fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
    }
}

fn pad(sample_rate: u32, secs: f64, freqs: &[f32], amp: f32) -> Vec<f32> {
    let n = (sample_rate as f64 * secs) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            freqs.iter().map(|f| amp * (2.0 * PI * f * t).sin()).sum()
        })
        .collect()
}

/// Accented noise-burst kick pattern over a sustained A minor triad (Camelot 8A).
pub fn club_track(sample_rate: u32, bpm: f64, secs: f64) -> WaveformBuffer {
    let mut samples = pad(sample_rate, secs, &A_MINOR_TRIAD, 0.12);
    let mut noise = Noise(99);
    let period = 60.0 / bpm;
    let burst = (sample_rate as f64 * 0.04) as usize;
    let tau = sample_rate as f32 * 0.01;

    let mut k = 0usize;
    loop {
        let start = (k as f64 * period * sample_rate as f64).round() as usize;
        if start >= samples.len() {
            break;
        }
        let amp = if k % 4 == 0 { 0.8 } else { 0.4 };
        for i in 0..burst.min(samples.len() - start) {
            samples[start + i] += amp * (-(i as f32) / tau).exp() * noise.next();
        }
        k += 1;
    }
    WaveformBuffer::from_mono(sample_rate, samples).unwrap()
}

/// Beatless, flat-energy pad.
pub fn ambient_pad(sample_rate: u32, secs: f64) -> WaveformBuffer {
    WaveformBuffer::from_mono(sample_rate, pad(sample_rate, secs, &A_MINOR_TRIAD, 0.1)).unwrap()
}

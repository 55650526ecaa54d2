//! Shared spectral helpers: windows, STFT magnitudes, the analysis-rate mono signal
//! and an FFT band splitter.

use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

use super::buffer::WaveformBuffer;

/// Analysis stages work on a mono signal decimated to roughly this rate.
pub const ANALYSIS_RATE_HZ: u32 = 11025;

const BAND_SPLIT_FFT_SIZE: usize = 4096;
const BAND_SPLIT_HOP: usize = BAND_SPLIT_FFT_SIZE / 4;
const CROSSOVER_TRANSITION_BINS: usize = 4;

/// Mono signal used by the analysis stages.
#[derive(Debug, Clone)]
pub struct AnalysisSignal {
    pub samples: Vec<f32>,
    pub rate: f64,
}

/// Downmixes to mono and decimates by an integer factor with a boxcar average.
pub fn analysis_signal(buffer: &WaveformBuffer) -> AnalysisSignal {
    let mono = buffer.to_mono();
    let factor = (buffer.sample_rate() / ANALYSIS_RATE_HZ).max(1) as usize;
    let rate = buffer.sample_rate() as f64 / factor as f64;
    if factor == 1 {
        return AnalysisSignal { samples: mono, rate };
    }
    let scale = 1.0 / factor as f32;
    let samples = mono
        .chunks_exact(factor)
        .map(|chunk| chunk.iter().sum::<f32>() * scale)
        .collect();
    AnalysisSignal { samples, rate }
}

pub fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()))
        .collect()
}

/// Magnitude spectra (bins `0..fft_size/2`) of Hann-windowed frames starting every `hop`
/// samples. A signal shorter than one frame yields a single zero-padded frame.
pub fn stft_magnitudes(samples: &[f32], fft_size: usize, hop: usize) -> Vec<Vec<f32>> {
    let num_frames = if samples.len() <= fft_size {
        1
    } else {
        (samples.len() - fft_size) / hop + 1
    };
    let hann = hann_window(fft_size);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);

    (0..num_frames)
        .into_par_iter()
        .map(|frame_idx| {
            let start = frame_idx * hop;
            let end = (start + fft_size).min(samples.len());
            let mut buf = vec![Complex::new(0.0, 0.0); fft_size];
            for (i, &s) in samples[start..end].iter().enumerate() {
                buf[i] = Complex::new(s * hann[i], 0.0);
            }
            fft.process(&mut buf);
            buf[..fft_size / 2].iter().map(|c| c.norm()).collect()
        })
        .collect()
}

/// Refines a sampled peak at `y1` using its neighbours. Returns the fractional offset in
/// `[-0.5, 0.5]` and the interpolated height.
pub fn parabolic_peak(y0: f32, y1: f32, y2: f32) -> (f32, f32) {
    let denom = y0 - 2.0 * y1 + y2;
    if denom.abs() < 1e-12 {
        return (0.0, y1);
    }
    let offset = (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
    (offset, y1 - 0.25 * (y0 - y2) * offset)
}

/// Linear interpolation into a sampled curve at a fractional index.
pub fn sample_at(values: &[f32], position: f64) -> f32 {
    if values.is_empty() || position < 0.0 {
        return 0.0;
    }
    let i = position.floor() as usize;
    if i + 1 >= values.len() {
        return values.get(i).copied().unwrap_or(0.0);
    }
    let frac = (position - i as f64) as f32;
    values[i] * (1.0 - frac) + values[i + 1] * frac
}

/// Power-weighted spectral centroid in Hz, averaged over the whole signal.
pub fn spectral_centroid(samples: &[f32], sample_rate: u32) -> f32 {
    let fft_size = 4096;
    let bin_hz = sample_rate as f32 / fft_size as f32;
    let frames = stft_magnitudes(samples, fft_size, fft_size / 2);

    let mut weighted = 0.0f64;
    let mut total = 0.0f64;
    for frame in &frames {
        for (bin, &mag) in frame.iter().enumerate() {
            let power = (mag as f64) * (mag as f64);
            weighted += bin as f64 * bin_hz as f64 * power;
            total += power;
        }
    }
    if total <= 1e-12 {
        0.0
    } else {
        (weighted / total) as f32
    }
}

/// Extracts the content below `cutoff_hz` with Hann overlap-add filtering and a
/// raised-cosine crossover. `input - low` is the complementary high band.
pub fn split_low_band(input: &[f32], cutoff_hz: f32, sample_rate: u32) -> Vec<f32> {
    let fft_size = BAND_SPLIT_FFT_SIZE;
    let hop = BAND_SPLIT_HOP;
    let cutoff_bin = (cutoff_hz * fft_size as f32 / sample_rate as f32).round() as usize;
    if cutoff_bin == 0 || input.is_empty() {
        return vec![0.0; input.len()];
    }

    // Pad both ends so every input sample sees the full window overlap.
    let mut padded = vec![0.0f32; fft_size];
    padded.extend_from_slice(input);
    padded.extend(std::iter::repeat(0.0).take(fft_size));

    let window = hann_window(fft_size);
    let mut planner = FftPlanner::<f32>::new();
    let fwd = planner.plan_fft_forward(fft_size);
    let inv = planner.plan_fft_inverse(fft_size);
    let norm = 1.0 / fft_size as f32;

    let half = fft_size / 2;
    let trans_start = cutoff_bin.saturating_sub(CROSSOVER_TRANSITION_BINS);
    let trans_end = (cutoff_bin + CROSSOVER_TRANSITION_BINS).min(half);
    let gains: Vec<f32> = (0..=half)
        .map(|bin| {
            if bin <= trans_start {
                1.0
            } else if bin >= trans_end {
                0.0
            } else {
                let t = (bin - trans_start) as f32 / (trans_end - trans_start) as f32;
                0.5 * (1.0 + (std::f32::consts::PI * t).cos())
            }
        })
        .collect();

    let mut low = vec![0.0f32; padded.len()];
    let mut window_sum = vec![0.0f32; padded.len()];
    let mut buf = vec![Complex::new(0.0f32, 0.0); fft_size];

    let mut pos = 0;
    while pos + fft_size <= padded.len() {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = Complex::new(padded[pos + i] * window[i], 0.0);
        }
        fwd.process(&mut buf);
        for bin in 0..=half {
            buf[bin] *= gains[bin];
            if bin > 0 && bin < half {
                buf[fft_size - bin] *= gains[bin];
            }
        }
        inv.process(&mut buf);
        for i in 0..fft_size {
            low[pos + i] += buf[i].re * norm * window[i];
            window_sum[pos + i] += window[i] * window[i];
        }
        pos += hop;
    }

    low[fft_size..fft_size + input.len()]
        .iter()
        .zip(&window_sum[fft_size..fft_size + input.len()])
        .map(|(&s, &ws)| if ws > 1e-6 { s / ws } else { 0.0 })
        .collect()
}

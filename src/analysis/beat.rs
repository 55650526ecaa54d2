//! Tempo and beat-grid estimation.
//!
//! Onset strength is the half-wave rectified spectral flux of log-compressed STFT
//! magnitudes on the analysis-rate mono signal. The tempo is the strongest peak of the
//! onset autocorrelation inside the configured BPM range; the grid is then fitted to the
//! individual onsets by least squares and the bar phase is the beat position (mod 4) that
//! carries the most onset energy.

use rayon::prelude::*;
use serde::Serialize;

use crate::audio::dsp::{self, parabolic_peak, sample_at};
use crate::audio::WaveformBuffer;
use crate::config::BeatConfig;
use crate::error::{AnalysisError, Diagnosed, Result};

/// Four beats to the bar.
pub const BEATS_PER_BAR: usize = 4;

const ONSET_WINDOW_SECS: f64 = 0.023;
const ONSET_COMPRESSION: f32 = 100.0;
const MIN_GRID_FIT_POINTS: usize = 8;
const MAX_GRID_FIT_DEVIATION: f64 = 0.03;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatGrid {
    pub bpm: f64,
    /// Time of the first downbeat in seconds.
    pub downbeat_offset: f64,
    /// Beat timestamps in seconds, strictly increasing.
    pub beats: Vec<f64>,
    pub confidence: f32,
}

impl BeatGrid {
    /// A regular grid at `bpm` whose downbeat lattice passes through `downbeat_offset`,
    /// covering `[0, duration)`.
    pub fn from_tempo(bpm: f64, downbeat_offset: f64, duration: f64, confidence: f32) -> Self {
        let period = 60.0 / bpm;
        let first = downbeat_offset.rem_euclid(period);
        let count = if duration > first {
            ((duration - first) / period).ceil() as usize
        } else {
            0
        };
        let beats = (0..count)
            .map(|k| first + k as f64 * period)
            .filter(|&t| t < duration)
            .collect();
        let bar = period * BEATS_PER_BAR as f64;
        Self {
            bpm,
            downbeat_offset: downbeat_offset.rem_euclid(bar),
            beats,
            confidence,
        }
    }

    pub fn beat_period(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn bar_period(&self) -> f64 {
        self.beat_period() * BEATS_PER_BAR as f64
    }

    fn is_downbeat(&self, t: f64) -> bool {
        let index = ((t - self.downbeat_offset) / self.beat_period()).round() as i64;
        index.rem_euclid(BEATS_PER_BAR as i64) == 0
    }

    pub fn downbeats(&self) -> Vec<f64> {
        self.beats.iter().copied().filter(|&t| self.is_downbeat(t)).collect()
    }

    pub fn nearest_beat(&self, t: f64) -> Option<f64> {
        nearest(&self.beats, t)
    }

    pub fn nearest_downbeat(&self, t: f64) -> Option<f64> {
        nearest(&self.downbeats(), t)
    }

    /// The downbeat lattice point closest to `t`, extrapolated past either end of the
    /// listed beats if necessary.
    pub fn downbeat_lattice_near(&self, t: f64) -> f64 {
        let bar = self.bar_period();
        self.downbeat_offset + ((t - self.downbeat_offset) / bar).round() * bar
    }

    /// The same grid expressed in a timeline that starts `offset` seconds earlier.
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            bpm: self.bpm,
            downbeat_offset: self.downbeat_offset + offset,
            beats: self.beats.iter().map(|t| t + offset).collect(),
            confidence: self.confidence,
        }
    }

    /// Rescales time by `factor` (a factor of 0.5 doubles the tempo).
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            bpm: self.bpm / factor,
            downbeat_offset: self.downbeat_offset * factor,
            beats: self.beats.iter().map(|t| t * factor).collect(),
            confidence: self.confidence,
        }
    }
}

fn nearest(sorted: &[f64], t: f64) -> Option<f64> {
    let idx = sorted.partition_point(|&b| b <= t);
    let before = idx.checked_sub(1).map(|i| sorted[i]);
    let after = sorted.get(idx).copied();
    match (before, after) {
        (Some(b), Some(a)) => Some(if t - b <= a - t { b } else { a }),
        (b, a) => b.or(a),
    }
}

/// Onset strength sampled at a fixed frame rate.
#[derive(Debug, Clone)]
pub struct OnsetCurve {
    pub values: Vec<f32>,
    pub frame_rate: f64,
    /// Time in seconds represented by frame 0.
    pub first_frame_time: f64,
}

impl OnsetCurve {
    pub fn compute(samples: &[f32], rate: f64) -> Self {
        let fft_size = ((rate * ONSET_WINDOW_SECS).round() as usize).next_power_of_two().max(64);
        let hop = fft_size / 4;
        let frames = dsp::stft_magnitudes(samples, fft_size, hop);

        let compressed: Vec<Vec<f32>> = frames
            .into_par_iter()
            .map(|mags| mags.into_iter().map(|m| (ONSET_COMPRESSION * m).ln_1p()).collect())
            .collect();

        let mut values = vec![0.0f32; compressed.len()];
        for i in 1..compressed.len() {
            values[i] = compressed[i]
                .iter()
                .zip(compressed[i - 1].iter())
                .map(|(cur, prev)| (cur - prev).max(0.0))
                .sum();
        }

        // A new attack first shows up in the newest hop of the window.
        let first_frame_time = (fft_size as f64 - hop as f64 / 2.0) / rate;
        Self {
            values,
            frame_rate: rate / hop as f64,
            first_frame_time,
        }
    }

    pub fn frame_time(&self, frame: f64) -> f64 {
        self.first_frame_time + frame / self.frame_rate
    }

    fn is_silent(&self) -> bool {
        self.values.iter().all(|&v| v < 1e-6)
    }
}

#[derive(Debug, Clone, Copy)]
struct TempoCandidate {
    lag: f64,
    bpm: f64,
    strength: f32,
}

pub fn analyze_beats(buffer: &WaveformBuffer, config: &BeatConfig) -> Result<Diagnosed<BeatGrid>> {
    if !(config.min_bpm > 0.0 && config.min_bpm < config.max_bpm) {
        return Err(AnalysisError::InvalidParameter(format!(
            "BPM range {}..{} is empty",
            config.min_bpm, config.max_bpm
        )));
    }

    let duration = buffer.duration_secs();
    let signal = dsp::analysis_signal(buffer);
    let onset = OnsetCurve::compute(&signal.samples, signal.rate);

    let lag_lo = ((onset.frame_rate * 60.0 / config.max_bpm).floor() as usize).max(2);
    let lag_hi = (onset.frame_rate * 60.0 / config.min_bpm).ceil() as usize;

    if onset.is_silent() || onset.values.len() < 2 * lag_hi + 2 {
        log::debug!("Onset curve too short or silent ({} frames)", onset.values.len());
        return Ok(fallback_grid(duration, config));
    }

    let acf = autocorrelation(&onset.values, lag_hi + 1);
    let candidates = tempo_candidates(&acf, lag_lo, lag_hi, onset.frame_rate, config);
    if candidates.is_empty() {
        log::debug!("No periodicity found in the onset autocorrelation");
        return Ok(fallback_grid(duration, config));
    }

    let onset_times = pick_onsets(&onset);
    let median_ioi = median_interval(&onset_times, 60.0 / config.max_bpm, 60.0 / config.min_bpm);
    let chosen = resolve_octave(&candidates, median_ioi, config.octave_strength_ratio);
    let confidence = peak_confidence(&candidates, chosen);

    let (phase, period) = fit_grid(&onset.values, candidates[chosen].lag);
    let bpm = 60.0 * onset.frame_rate / period;
    let bar_phase = strongest_bar_phase(&onset.values, phase, period);
    let downbeat_time = onset.frame_time(phase + bar_phase as f64 * period);

    log::debug!(
        "Tempo candidates: {:?}, chosen {:.2} BPM (acf lag {:.2}, fitted {:.3})",
        candidates.iter().take(4).map(|c| (c.bpm.round(), c.strength)).collect::<Vec<_>>(),
        bpm,
        candidates[chosen].lag,
        period
    );

    let grid = BeatGrid::from_tempo(bpm, downbeat_time, duration, confidence);
    log::info!(
        "Beat grid: {:.2} BPM, first downbeat {:.3}s, {} beats, confidence {:.2}",
        grid.bpm,
        grid.downbeat_offset,
        grid.beats.len(),
        grid.confidence
    );

    let mut result = Diagnosed::clean(grid);
    if confidence < config.confidence_threshold {
        result.warn(AnalysisError::AmbiguousBeatGrid {
            confidence,
            threshold: config.confidence_threshold,
        });
    }
    Ok(result)
}

fn fallback_grid(duration: f64, config: &BeatConfig) -> Diagnosed<BeatGrid> {
    let mut result = Diagnosed::clean(BeatGrid::from_tempo(config.fallback_bpm, 0.0, duration, 0.0));
    result.warn(AnalysisError::AmbiguousBeatGrid {
        confidence: 0.0,
        threshold: config.confidence_threshold,
    });
    result.note(format!("no rhythmic periodicity found; assuming {} BPM", config.fallback_bpm));
    result
}

/// Mean-removed, unbiased autocorrelation normalised to lag 0.
fn autocorrelation(values: &[f32], max_lag: usize) -> Vec<f32> {
    let n = values.len();
    let mean = values.iter().sum::<f32>() / n as f32;
    let centered: Vec<f32> = values.iter().map(|v| v - mean).collect();

    let raw: Vec<f32> = (0..=max_lag.min(n - 1))
        .into_par_iter()
        .map(|lag| {
            let sum: f32 = centered[..n - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum();
            sum / (n - lag) as f32
        })
        .collect();

    let zero = raw[0];
    if zero <= 0.0 {
        return vec![0.0; raw.len()];
    }
    raw.into_iter().map(|v| v / zero).collect()
}

fn tempo_candidates(
    acf: &[f32],
    lag_lo: usize,
    lag_hi: usize,
    frame_rate: f64,
    config: &BeatConfig,
) -> Vec<TempoCandidate> {
    let mut candidates = Vec::new();
    for lag in lag_lo..=lag_hi.min(acf.len().saturating_sub(2)) {
        let (y0, y1, y2) = (acf[lag - 1], acf[lag], acf[lag + 1]);
        if y1 <= 0.0 || y1 <= y0 || y1 < y2 {
            continue;
        }
        let (offset, strength) = parabolic_peak(y0, y1, y2);
        let refined = lag as f64 + offset as f64;
        let bpm = 60.0 * frame_rate / refined;
        if bpm < config.min_bpm * 0.99 || bpm > config.max_bpm * 1.01 {
            continue;
        }
        candidates.push(TempoCandidate {
            lag: refined,
            bpm,
            strength,
        });
    }
    candidates.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    candidates
}

fn integer_related(a: f64, b: f64) -> bool {
    let ratio = a.max(b) / a.min(b);
    let n = ratio.round();
    n >= 2.0 && ((ratio - n) / n).abs() <= 0.01
}

/// Among candidates related to the winner by an integer tempo multiple and nearly as strong,
/// prefers the one whose period is closest to the median inter-onset interval.
fn resolve_octave(candidates: &[TempoCandidate], median_ioi: Option<f64>, strength_ratio: f32) -> usize {
    let Some(ioi) = median_ioi else {
        return 0;
    };
    let winner = candidates[0];
    let distance = |bpm: f64| (60.0 / bpm / ioi).ln().abs();

    let mut best = 0;
    let mut best_distance = distance(winner.bpm);
    for (i, c) in candidates.iter().enumerate().skip(1) {
        if c.strength < winner.strength * strength_ratio {
            break;
        }
        if !integer_related(winner.bpm, c.bpm) {
            continue;
        }
        let d = distance(c.bpm);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    if best != 0 {
        log::debug!(
            "Octave tie-break: {:.1} BPM preferred over {:.1} BPM (median IOI {:.3}s)",
            candidates[best].bpm, winner.bpm, ioi
        );
    }
    best
}

/// Strength of the chosen peak relative to the strongest competing one. Integer multiples of
/// the chosen tempo are the same periodicity and were already weighed by the octave tie-break.
fn peak_confidence(candidates: &[TempoCandidate], chosen: usize) -> f32 {
    let winner = candidates[chosen];
    if winner.strength <= 0.0 {
        return 0.0;
    }
    let runner_up = candidates
        .iter()
        .enumerate()
        .filter(|&(i, c)| i != chosen && !integer_related(winner.bpm, c.bpm))
        .map(|(_, c)| c.strength)
        .fold(0.0f32, f32::max);
    ((winner.strength - runner_up) / winner.strength).clamp(0.0, 1.0)
}

/// Locks a beat lattice onto the onset curve. Returns `(phase, period)` in frames, with the
/// phase in `[0, period)`.
fn fit_grid(values: &[f32], period: f64) -> (f64, f64) {
    let n = values.len();
    let comb_span = (16.0 * period).min(n as f64 - 1.0);

    let mut coarse_phase = 0.0;
    let mut best_score = f32::MIN;
    let steps = (period * 4.0).ceil() as usize;
    for s in 0..steps {
        let phase = s as f64 * 0.25;
        let mut score = 0.0;
        let mut pos = phase;
        while pos < comb_span {
            score += sample_at(values, pos);
            pos += period;
        }
        if score > best_score {
            best_score = score;
            coarse_phase = phase;
        }
    }

    // Follow the onsets beat by beat so a slightly wrong period cannot drift off the grid.
    let mean = values.iter().sum::<f32>() / n as f32;
    let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32).sqrt();
    let threshold = mean + std;
    let half_window = (period * 0.25).max(1.0);

    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut expected = coarse_phase;
    let mut k = 0usize;
    while expected < (n - 1) as f64 {
        let lo = ((expected - half_window).floor().max(1.0)) as usize;
        let hi = ((expected + half_window).ceil() as usize).min(n - 2);
        let mut next = expected + period;
        if lo <= hi {
            let m = (lo..=hi)
                .max_by(|&a, &b| values[a].total_cmp(&values[b]))
                .unwrap_or(lo);
            if values[m] > threshold {
                let (offset, _) = parabolic_peak(values[m - 1], values[m], values[m + 1]);
                let pos = m as f64 + offset as f64;
                points.push((k as f64, pos));
                next = pos + period;
            }
        }
        expected = next;
        k += 1;
    }

    match least_squares(&points) {
        Some((intercept, slope))
            if points.len() >= MIN_GRID_FIT_POINTS
                && ((slope - period) / period).abs() <= MAX_GRID_FIT_DEVIATION =>
        {
            (intercept.rem_euclid(slope), slope)
        }
        _ => (coarse_phase.rem_euclid(period), period),
    }
}

fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = points.iter().map(|p| (p.0 - mean_x) * (p.1 - mean_y)).sum();
    let slope = sxy / sxx;
    Some((mean_y - slope * mean_x, slope))
}

/// Which of the four beat positions in a bar collects the most onset energy.
fn strongest_bar_phase(values: &[f32], phase: f64, period: f64) -> usize {
    let mut scores = [0.0f32; BEATS_PER_BAR];
    let mut pos = phase;
    let mut k = 0usize;
    while pos < values.len() as f64 {
        let centre = pos.round() as usize;
        let lo = centre.saturating_sub(2);
        let hi = (centre + 2).min(values.len() - 1);
        let local = values[lo..=hi].iter().copied().fold(0.0f32, f32::max);
        scores[k % BEATS_PER_BAR] += local;
        pos += period;
        k += 1;
    }
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// Peak-picks the onset curve with an adaptive threshold. Returns onset times in seconds.
fn pick_onsets(onset: &OnsetCurve) -> Vec<f64> {
    let values = &onset.values;
    let window = (onset.frame_rate * 0.2).round() as usize;
    let min_gap = 0.1;
    let mut times: Vec<f64> = Vec::new();

    for i in 0..values.len() {
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(values.len());
        let local_mean = values[start..end].iter().sum::<f32>() / (end - start) as f32;
        let threshold = local_mean * 1.5 + 0.01;
        if values[i] <= threshold {
            continue;
        }
        let is_peak = (i == 0 || values[i] >= values[i - 1])
            && (i == values.len() - 1 || values[i] >= values[i + 1]);
        let t = onset.frame_time(i as f64);
        let far_enough = times.last().map_or(true, |&last| t - last > min_gap);
        if is_peak && far_enough {
            times.push(t);
        }
    }
    times
}

fn median_interval(times: &[f64], min: f64, max: f64) -> Option<f64> {
    let mut intervals: Vec<f64> = times
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&i| i >= min && i <= max)
        .collect();
    if intervals.is_empty() {
        return None;
    }
    intervals.sort_by(|a, b| a.total_cmp(b));
    Some(intervals[intervals.len() / 2])
}

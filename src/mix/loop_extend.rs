//! Extends a track to a target duration by repeating a bar-aligned loop.
//!
//! Candidate loops start on a downbeat and span whole bars. A candidate is scored by the
//! cosine similarity of the magnitude spectra just after its start and just after its end,
//! since that is what the listener hears on either side of each seam.

use serde::Serialize;

use super::transition::{crossfade_into, CrossfadeShape};
use crate::analysis::beat::BeatGrid;
use crate::audio::dsp::{analysis_signal, stft_magnitudes};
use crate::audio::WaveformBuffer;
use crate::config::LoopConfig;
use crate::error::{AnalysisError, Diagnosed, Result};

const FEATURE_FFT_SIZE: usize = 1024;
const FEATURE_HOP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopPoints {
    pub start_secs: f64,
    pub end_secs: f64,
    pub bars: u32,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct ExtendedTrack {
    pub buffer: WaveformBuffer,
    /// Absent when the source was already long enough and was only trimmed.
    pub loop_points: Option<LoopPoints>,
    pub repetitions: usize,
    /// Output times (seconds) where each seam crossfade begins.
    pub seams: Vec<f64>,
}

struct SpectralFeatures {
    frames: Vec<Vec<f32>>,
    frame_rate: f64,
}

impl SpectralFeatures {
    fn compute(buffer: &WaveformBuffer) -> Self {
        let signal = analysis_signal(buffer);
        let frames = stft_magnitudes(&signal.samples, FEATURE_FFT_SIZE, FEATURE_HOP)
            .into_iter()
            .map(|mags| mags.into_iter().map(|m| (10.0 * m).ln_1p()).collect())
            .collect();
        Self {
            frames,
            frame_rate: signal.rate / FEATURE_HOP as f64,
        }
    }

    fn index(&self, secs: f64) -> usize {
        (secs * self.frame_rate).round() as usize
    }

    /// Cosine similarity of the `len`-frame windows starting at `a` and `b`.
    fn similarity(&self, a: usize, b: usize, len: usize) -> Option<f32> {
        if a + len > self.frames.len() || b + len > self.frames.len() {
            return None;
        }
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for k in 0..len {
            for (&x, &y) in self.frames[a + k].iter().zip(&self.frames[b + k]) {
                dot += x as f64 * y as f64;
                norm_a += x as f64 * x as f64;
                norm_b += y as f64 * y as f64;
            }
        }
        if norm_a <= 1e-12 || norm_b <= 1e-12 {
            return Some(0.0);
        }
        Some((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
    }
}

/// Finds the most self-similar whole-bar loop that satisfies the length floor.
pub fn find_loop_points(buffer: &WaveformBuffer, grid: &BeatGrid, config: &LoopConfig) -> Result<LoopPoints> {
    let duration = buffer.duration_secs();
    let beat = grid.beat_period();
    let bar = grid.bar_period();
    let compare = config.compare_beats as f64 * beat;
    let seam = config.seam_beats as f64 * beat;
    let tail = compare.max(seam);

    let features = SpectralFeatures::compute(buffer);
    let compare_frames = features.index(compare).max(1);

    let mut starts = grid.downbeats();
    if starts.is_empty() {
        starts.push(grid.downbeat_offset.max(0.0));
    }

    let mut best: Option<LoopPoints> = None;
    for &start in &starts {
        for bars in 1..=config.max_loop_bars {
            let length = bars as f64 * bar;
            if length < config.min_loop_secs {
                continue;
            }
            let end = start + length;
            if end + tail > duration + 1e-9 {
                break;
            }
            let Some(score) = features.similarity(features.index(start), features.index(end), compare_frames) else {
                break;
            };
            let better = match &best {
                None => true,
                Some(b) => score > b.similarity + 1e-4 || (score > b.similarity - 1e-4 && bars > b.bars),
            };
            if better {
                best = Some(LoopPoints {
                    start_secs: start,
                    end_secs: end,
                    bars,
                    similarity: score,
                });
            }
        }
    }

    match best {
        Some(points) if points.similarity >= config.min_similarity => {
            log::info!(
                "Loop: {:.2}s -> {:.2}s ({} bars), similarity {:.3}",
                points.start_secs, points.end_secs, points.bars, points.similarity
            );
            Ok(points)
        }
        other => Err(AnalysisError::NoViableLoopPoint {
            best_similarity: other.map_or(0.0, |p| p.similarity),
            threshold: config.min_similarity,
        }),
    }
}

fn fade_out_tail(channel: &mut [f32], frames: usize) {
    let frames = frames.min(channel.len());
    let start = channel.len() - frames;
    for (i, s) in channel[start..].iter_mut().enumerate() {
        *s *= CrossfadeShape::Linear.fade_out((i + 1) as f32 / frames as f32);
    }
}

pub fn extend_track(
    buffer: &WaveformBuffer,
    grid: &BeatGrid,
    target_secs: f64,
    config: &LoopConfig,
) -> Result<Diagnosed<ExtendedTrack>> {
    if !(target_secs.is_finite() && target_secs >= grid.beat_period()) {
        return Err(AnalysisError::InvalidParameter(format!(
            "target duration must be at least one beat ({:.3}s), got {target_secs}",
            grid.beat_period()
        )));
    }

    let beat_frames = buffer.frames_for_secs(grid.beat_period()).max(1);
    let seam_frames = beat_frames * config.seam_beats as usize;
    let target_frames = buffer.frames_for_secs(target_secs);

    if target_frames <= buffer.frames() {
        let mut result = Diagnosed::clean(());
        result.note(format!(
            "source is already {:.1}s; trimmed to {:.1}s instead of looping",
            buffer.duration_secs(),
            target_secs
        ));
        let channels = buffer
            .channels()
            .iter()
            .map(|ch| {
                let mut out = ch[..target_frames].to_vec();
                fade_out_tail(&mut out, seam_frames);
                out
            })
            .collect();
        return Ok(result.map(|_| ExtendedTrack {
            buffer: WaveformBuffer::from_planar(buffer.sample_rate(), channels),
            loop_points: None,
            repetitions: 0,
            seams: Vec::new(),
        }));
    }

    let points = find_loop_points(buffer, grid, config)?;
    let start = buffer.frames_for_secs(points.start_secs);
    let end = buffer.frames_for_secs(points.end_secs);
    let loop_len = end - start;
    let seam = seam_frames.min(buffer.frames() - end);

    // Tile count and final partial tile are the same for every channel.
    let mut repetitions = 0usize;
    let mut length = end + seam;
    let mut seams = Vec::new();
    while length + loop_len <= target_frames {
        seams.push((length - seam) as f64 / buffer.sample_rate() as f64);
        length += loop_len;
        repetitions += 1;
    }
    let remainder = target_frames - length;
    let final_tile = ((remainder as f64 / beat_frames as f64).round() as usize * beat_frames)
        .min(loop_len)
        .min(buffer.frames() - start - seam);
    if final_tile > 0 {
        seams.push((length - seam) as f64 / buffer.sample_rate() as f64);
    }

    let channels = buffer
        .channels()
        .iter()
        .map(|ch| {
            let mut out = Vec::with_capacity(length + final_tile);
            out.extend_from_slice(&ch[..end + seam]);
            for _ in 0..repetitions {
                crossfade_into(&mut out, &ch[start..end + seam], seam, CrossfadeShape::Linear);
            }
            if final_tile > 0 {
                crossfade_into(&mut out, &ch[start..start + final_tile + seam], seam, CrossfadeShape::Linear);
            }
            fade_out_tail(&mut out, seam);
            out
        })
        .collect();

    let extended = WaveformBuffer::from_planar(buffer.sample_rate(), channels);
    log::info!(
        "Extended {:.1}s -> {:.1}s with {} full loop repetitions",
        buffer.duration_secs(),
        extended.duration_secs(),
        repetitions
    );

    Ok(Diagnosed::clean(ExtendedTrack {
        buffer: extended,
        loop_points: Some(points),
        repetitions,
        seams,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_signals::{tones, Noise, A_MINOR_TRIAD};

    #[test]
    fn test_extends_to_target_within_one_beat() {
        let buffer = tones(22050, 30.0, &A_MINOR_TRIAD, 0.1);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 30.0, 1.0);
        let result = extend_track(&buffer, &grid, 100.0, &LoopConfig::default()).unwrap();
        let track = result.value;

        assert!(
            (track.buffer.duration_secs() - 100.0).abs() <= grid.beat_period(),
            "duration {:.3}s",
            track.buffer.duration_secs()
        );
        let points = track.loop_points.expect("loop points");
        assert!(points.end_secs - points.start_secs >= LoopConfig::default().min_loop_secs);
        assert!(points.similarity >= 0.8);
        assert!(track.repetitions >= 2);
    }

    #[test]
    fn test_seams_are_continuous() {
        let buffer = tones(22050, 30.0, &A_MINOR_TRIAD, 0.1);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 30.0, 1.0);
        let track = extend_track(&buffer, &grid, 95.0, &LoopConfig::default()).unwrap().value;

        let ch = track.buffer.channel(0);
        let max_step = ch.windows(2).map(|w| (w[1] - w[0]).abs()).fold(0.0f32, f32::max);
        assert!(max_step < 0.05, "largest sample step {max_step}");

        for seam in &track.seams {
            let i = (seam * 22050.0).round() as usize;
            assert!((ch[i] - ch[i - 1]).abs() < 0.05, "discontinuity at seam {seam:.2}s");
        }
    }

    #[test]
    fn test_noise_has_no_viable_loop_at_strict_threshold() {
        let mut noise = Noise::new(42);
        let samples: Vec<f32> = (0..22050 * 20).map(|_| noise.next() * 0.3).collect();
        let buffer = WaveformBuffer::from_mono(22050, samples).unwrap();
        let grid = BeatGrid::from_tempo(120.0, 0.0, 20.0, 0.0);
        let config = LoopConfig { min_similarity: 0.99, ..LoopConfig::default() };

        let err = extend_track(&buffer, &grid, 120.0, &config).unwrap_err();
        assert!(matches!(err, AnalysisError::NoViableLoopPoint { .. }), "{err:?}");
    }

    #[test]
    fn test_short_target_trims_instead_of_looping() {
        let buffer = tones(22050, 10.0, &[220.0], 0.2);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 10.0, 1.0);
        let result = extend_track(&buffer, &grid, 6.0, &LoopConfig::default()).unwrap();
        assert_eq!(result.value.buffer.frames(), 6 * 22050);
        assert!(result.value.loop_points.is_none());
        assert_eq!(result.notes.len(), 1);
    }

    #[test]
    fn test_target_shorter_than_a_beat_is_rejected() {
        let buffer = tones(22050, 10.0, &[220.0], 0.2);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 10.0, 1.0);
        for target in [0.00001, 0.4, f64::NAN] {
            assert!(
                matches!(
                    extend_track(&buffer, &grid, target, &LoopConfig::default()),
                    Err(AnalysisError::InvalidParameter(_))
                ),
                "accepted {target}"
            );
        }
        let one_beat = extend_track(&buffer, &grid, 0.5, &LoopConfig::default()).unwrap();
        assert_eq!(one_beat.value.buffer.frames(), 11025);
    }

    #[test]
    fn test_loop_shorter_than_floor_is_never_chosen() {
        // 12s of material at 120 BPM leaves room only for loops of at most 5 bars (10s).
        let buffer = tones(22050, 12.0, &[220.0], 0.2);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 12.0, 1.0);
        let config = LoopConfig { min_loop_secs: 11.0, ..LoopConfig::default() };
        assert!(matches!(
            find_loop_points(&buffer, &grid, &config),
            Err(AnalysisError::NoViableLoopPoint { .. })
        ));
    }
}

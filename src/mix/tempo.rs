//! Pitch-preserving tempo change using WSOLA (waveform-similarity overlap-add).
//!
//! A stretch ratio is `target_bpm / source_bpm`: values above one speed the track up and
//! shorten it. The output always holds `round(frames / ratio)` frames.

use crate::audio::dsp::hann_window;
use crate::audio::WaveformBuffer;
use crate::config::TempoConfig;
use crate::error::{AnalysisError, Diagnosed, Result};

const MIN_RATIO: f64 = 0.25;
const MAX_RATIO: f64 = 4.0;
const COARSE_STEP: usize = 4;

pub fn stretch_ratio(source_bpm: f64, target_bpm: f64) -> f64 {
    target_bpm / source_bpm
}

pub fn match_tempo(
    buffer: WaveformBuffer,
    source_bpm: f64,
    target_bpm: f64,
    config: &TempoConfig,
) -> Result<Diagnosed<WaveformBuffer>> {
    for bpm in [source_bpm, target_bpm] {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(AnalysisError::InvalidParameter(format!("tempo must be positive, got {bpm}")));
        }
    }

    if (target_bpm - source_bpm).abs() < config.tolerance_bpm {
        let mut result = Diagnosed::clean(buffer);
        result.note(format!(
            "tempo match skipped: {:.2} BPM is within {:.2} of the {:.2} BPM target",
            source_bpm, config.tolerance_bpm, target_bpm
        ));
        return Ok(result);
    }

    let ratio = stretch_ratio(source_bpm, target_bpm);
    let mut result = Diagnosed::clean(());
    if (ratio - 1.0).abs() > config.max_stretch_deviation {
        result.warn(AnalysisError::ExcessiveTempoMismatch {
            source_bpm,
            target_bpm,
            ratio,
        });
    }

    log::info!("Time-stretching {:.2} -> {:.2} BPM (ratio {:.4})", source_bpm, target_bpm, ratio);
    let stretched = time_stretch(&buffer, ratio, config.frame_secs)?;
    Ok(result.map(|_| stretched))
}

/// Changes playback speed by `ratio` without changing pitch.
pub fn time_stretch(buffer: &WaveformBuffer, ratio: f64, frame_secs: f64) -> Result<WaveformBuffer> {
    if !(MIN_RATIO..=MAX_RATIO).contains(&ratio) {
        return Err(AnalysisError::InvalidParameter(format!(
            "stretch ratio {ratio:.3} outside {MIN_RATIO}..{MAX_RATIO}"
        )));
    }

    let input_len = buffer.frames();
    let output_len = (input_len as f64 / ratio).round() as usize;
    let frame_len = ((buffer.sample_rate() as f64 * frame_secs).round() as usize).max(64) & !1;
    let synthesis_hop = frame_len / 2;
    let analysis_hop = synthesis_hop as f64 * ratio;
    let tolerance = frame_len / 4;
    let overlap = frame_len - synthesis_hop;

    let guide = buffer.to_mono();
    let window = hann_window(frame_len);
    let frame_count = output_len / synthesis_hop + 2;

    let mut positions = Vec::with_capacity(frame_count);
    let mut previous = 0usize;
    for k in 0..frame_count {
        let nominal = (k as f64 * analysis_hop).round() as usize;
        let pos = if k == 0 {
            0
        } else {
            best_offset(&guide, previous + synthesis_hop, nominal, tolerance, overlap)
        };
        positions.push(pos);
        previous = pos;
    }

    let padded_len = frame_count * synthesis_hop + frame_len;
    let mut window_sum = vec![0.0f32; padded_len];
    for k in 0..frame_count {
        let base = k * synthesis_hop;
        for (i, w) in window.iter().enumerate() {
            window_sum[base + i] += w;
        }
    }

    let channels = buffer
        .channels()
        .iter()
        .map(|input| {
            let mut out = vec![0.0f32; padded_len];
            for (k, &pos) in positions.iter().enumerate() {
                let base = k * synthesis_hop;
                for (i, w) in window.iter().enumerate() {
                    if let Some(&s) = input.get(pos + i) {
                        out[base + i] += s * w;
                    }
                }
            }
            for (s, &ws) in out.iter_mut().zip(&window_sum) {
                if ws > 1e-3 {
                    *s /= ws;
                }
            }
            out.truncate(output_len);
            out
        })
        .collect();

    log::debug!(
        "WSOLA: {} -> {} frames, frame {} hop {} tolerance {}",
        input_len, output_len, frame_len, synthesis_hop, tolerance
    );
    Ok(WaveformBuffer::from_planar(buffer.sample_rate(), channels))
}

fn sample(signal: &[f32], index: isize) -> f32 {
    if index < 0 {
        0.0
    } else {
        signal.get(index as usize).copied().unwrap_or(0.0)
    }
}

fn similarity(signal: &[f32], reference: usize, candidate: isize, len: usize, step: usize) -> f32 {
    let mut dot = 0.0f32;
    let mut energy = 1e-9f32;
    let mut i = 0;
    while i < len {
        let c = sample(signal, candidate + i as isize);
        dot += sample(signal, (reference + i) as isize) * c;
        energy += c * c;
        i += step;
    }
    dot / energy.sqrt()
}

/// Start position within `nominal ± tolerance` whose waveform best continues the
/// segment at `natural`.
fn best_offset(signal: &[f32], natural: usize, nominal: usize, tolerance: usize, len: usize) -> usize {
    let lo = nominal as isize - tolerance as isize;
    let hi = nominal as isize + tolerance as isize;

    let mut best = nominal as isize;
    let mut best_score = f32::MIN;
    let mut candidate = lo;
    while candidate <= hi {
        let score = similarity(signal, natural, candidate, len, COARSE_STEP);
        if score > best_score {
            best_score = score;
            best = candidate;
        }
        candidate += COARSE_STEP as isize;
    }

    let coarse = best;
    best_score = f32::MIN;
    for candidate in (coarse - COARSE_STEP as isize + 1)..(coarse + COARSE_STEP as isize) {
        if candidate < lo || candidate > hi {
            continue;
        }
        let score = similarity(signal, natural, candidate, len, 1);
        if score > best_score {
            best_score = score;
            best = candidate;
        }
    }
    best.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::dsp::spectral_centroid;
    use crate::test_signals::tones;

    #[test]
    fn test_output_length_scales_by_ratio() {
        let buffer = tones(44100, 3.0, &[440.0], 0.5);
        for ratio in [0.9, 1.0, 1.1, 1.25] {
            let out = time_stretch(&buffer, ratio, 0.03).unwrap();
            let expected = (buffer.frames() as f64 / ratio).round() as usize;
            assert_eq!(out.frames(), expected, "ratio {ratio}");
        }
    }

    #[test]
    fn test_pitch_is_preserved() {
        let buffer = tones(44100, 3.0, &[440.0], 0.5);
        let out = time_stretch(&buffer, 1.1, 0.03).unwrap();
        let body = &out.channel(0)[4410..out.frames() - 4410];
        let centroid = spectral_centroid(body, 44100);
        assert!((centroid - 440.0).abs() / 440.0 < 0.03, "centroid {centroid:.1} Hz");
    }

    #[test]
    fn test_stereo_channels_stay_coherent() {
        let left = tones(22050, 2.0, &[330.0], 0.4);
        let buffer = WaveformBuffer::new(22050, vec![left.channel(0).to_vec(), left.channel(0).to_vec()]).unwrap();
        let out = time_stretch(&buffer, 0.8, 0.03).unwrap();
        assert_eq!(out.channel(0), out.channel(1));
    }

    #[test]
    fn test_match_within_tolerance_is_skipped() {
        let buffer = tones(22050, 1.0, &[440.0], 0.5);
        let result = match_tempo(buffer.clone(), 127.8, 128.0, &TempoConfig::default()).unwrap();
        assert_eq!(result.value, buffer);
        assert_eq!(result.notes.len(), 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_excessive_mismatch_warns_but_stretches() {
        let buffer = tones(22050, 2.0, &[440.0], 0.5);
        let frames = buffer.frames();
        let result = match_tempo(buffer, 100.0, 130.0, &TempoConfig::default()).unwrap();
        assert!(matches!(
            result.warnings.as_slice(),
            [AnalysisError::ExcessiveTempoMismatch { .. }]
        ));
        assert_eq!(result.value.frames(), (frames as f64 / 1.3).round() as usize);
    }

    #[test]
    fn test_rejects_nonsense_tempo() {
        let buffer = tones(22050, 0.5, &[440.0], 0.5);
        assert!(match_tempo(buffer.clone(), 0.0, 128.0, &TempoConfig::default()).is_err());
        assert!(time_stretch(&buffer, 8.0, 0.03).is_err());
    }
}

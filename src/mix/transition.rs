//! Overlap rendering between an outgoing and an incoming track.
//!
//! Both buffers arrive already trimmed and beat-aligned: the last `length` seconds of `a`
//! overlap the first `length` seconds of `b`, so the output always holds
//! `len(a) + len(b) - length` frames.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};

use crate::audio::dsp::split_low_band;
use crate::audio::WaveformBuffer;
use crate::config::TransitionConfig;
use crate::error::{AnalysisError, Diagnosed, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadeShape {
    /// Gains sum to one; right for correlated material.
    #[default]
    Linear,
    /// sin/cos gains; constant power for uncorrelated material.
    EqualPower,
    SCurve,
}

impl CrossfadeShape {
    pub fn fade_in(self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            CrossfadeShape::Linear => t,
            CrossfadeShape::EqualPower => (t * FRAC_PI_2).sin(),
            CrossfadeShape::SCurve => 0.5 * (1.0 - (PI * t).cos()),
        }
    }

    pub fn fade_out(self, position: f32) -> f32 {
        let t = position.clamp(0.0, 1.0);
        match self {
            CrossfadeShape::EqualPower => (t * FRAC_PI_2).cos(),
            _ => self.fade_in(1.0 - t),
        }
    }
}

/// Style selector as it appears on the command line and in config files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StyleName {
    #[default]
    Classic,
    #[value(name = "bass_swap")]
    BassSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum TransitionStyle {
    /// Full-band crossfade.
    Classic { shape: CrossfadeShape },
    /// Highs crossfade over the whole overlap while the band below `cutoff_hz` is swapped
    /// quickly around the midpoint, so the two basslines never play together.
    BassSwap { cutoff_hz: f32, swap_fraction: f32 },
}

impl TransitionStyle {
    pub fn from_config(name: StyleName, config: &TransitionConfig) -> Self {
        match name {
            StyleName::Classic => TransitionStyle::Classic { shape: config.shape },
            StyleName::BassSwap => TransitionStyle::BassSwap {
                cutoff_hz: config.bass_cutoff_hz,
                swap_fraction: config.bass_swap_fraction,
            },
        }
    }

    pub fn name(&self) -> StyleName {
        match self {
            TransitionStyle::Classic { .. } => StyleName::Classic,
            TransitionStyle::BassSwap { .. } => StyleName::BassSwap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub style: TransitionStyle,
    pub length_secs: f64,
    /// Beat-grid confidence of the outgoing and incoming track.
    pub confidence_a: f32,
    pub confidence_b: f32,
    pub min_alignment_confidence: f32,
}

/// Crossfades `next` onto the tail of `out` over `fade` frames and appends the rest of `next`.
pub fn crossfade_into(out: &mut Vec<f32>, next: &[f32], fade: usize, shape: CrossfadeShape) {
    let fade = fade.min(out.len()).min(next.len());
    let start = out.len() - fade;
    for i in 0..fade {
        let t = i as f32 / fade as f32;
        out[start + i] = out[start + i] * shape.fade_out(t) + next[i] * shape.fade_in(t);
    }
    out.extend_from_slice(&next[fade..]);
}

fn bass_swap_into(out: &mut Vec<f32>, next: &[f32], fade: usize, cutoff_hz: f32, swap_fraction: f32, sample_rate: u32) {
    let fade = fade.min(out.len()).min(next.len());
    if fade == 0 {
        out.extend_from_slice(next);
        return;
    }
    let start = out.len() - fade;
    let low_out = split_low_band(&out[start..], cutoff_hz, sample_rate);
    let low_in = split_low_band(&next[..fade], cutoff_hz, sample_rate);

    let swap = ((fade as f32 * swap_fraction).round() as usize).clamp(1, fade);
    let swap_start = (fade - swap) / 2;

    for i in 0..fade {
        let t = i as f32 / fade as f32;
        let u = (i as f32 - swap_start as f32) / swap as f32;
        let bass_in = CrossfadeShape::SCurve.fade_in(u);

        let high_out = out[start + i] - low_out[i];
        let high_in = next[i] - low_in[i];
        out[start + i] = low_out[i] * (1.0 - bass_in)
            + low_in[i] * bass_in
            + high_out * (1.0 - t)
            + high_in * t;
    }
    out.extend_from_slice(&next[fade..]);
}

pub fn render_transition(
    a: WaveformBuffer,
    b: WaveformBuffer,
    request: &TransitionRequest,
) -> Result<Diagnosed<WaveformBuffer>> {
    if a.sample_rate() != b.sample_rate() || a.channel_count() != b.channel_count() {
        return Err(AnalysisError::UnsupportedInput(format!(
            "transition inputs differ in layout ({}Hz/{}ch vs {}Hz/{}ch)",
            a.sample_rate(),
            a.channel_count(),
            b.sample_rate(),
            b.channel_count()
        )));
    }
    if !(request.length_secs.is_finite() && request.length_secs >= 0.0) {
        return Err(AnalysisError::InvalidParameter(format!(
            "transition length must be non-negative, got {}",
            request.length_secs
        )));
    }

    let sample_rate = a.sample_rate();
    let requested = a.frames_for_secs(request.length_secs);
    let fade = requested.min(a.frames()).min(b.frames());
    let mut result = Diagnosed::clean(());

    if fade < requested {
        result.note(format!(
            "transition shortened from {:.2}s to {:.2}s to fit the material",
            request.length_secs,
            fade as f64 / sample_rate as f64
        ));
    }
    let weakest = request.confidence_a.min(request.confidence_b);
    if weakest < request.min_alignment_confidence {
        result.note(format!(
            "beat alignment is best-effort (grid confidence {:.2}); transition quality may be degraded",
            weakest
        ));
    }

    log::debug!(
        "Rendering {:?} transition over {} frames ({} + {} input frames)",
        request.style.name(),
        fade,
        a.frames(),
        b.frames()
    );

    let incoming = b.into_channels();
    let mut channels = a.into_channels();
    for (out, next) in channels.iter_mut().zip(&incoming) {
        match request.style {
            TransitionStyle::Classic { shape } => crossfade_into(out, next, fade, shape),
            TransitionStyle::BassSwap { cutoff_hz, swap_fraction } => {
                bass_swap_into(out, next, fade, cutoff_hz, swap_fraction, sample_rate)
            }
        }
    }

    Ok(result.map(|_| WaveformBuffer::from_planar(sample_rate, channels)))
}

//! Section boundary detection on the smoothed energy envelope.
//!
//! Levels are expressed as fractions of the envelope's dynamic range above its floor
//! (10th percentile). All markers are snapped to the nearest beat.

use serde::Serialize;

use super::beat::BeatGrid;
use super::energy::EnergyProfile;
use crate::config::StructureConfig;
use crate::error::Diagnosed;

const FLOOR_PERCENTILE: f64 = 0.1;
const MIN_BUILDUP_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StructureMarkers {
    pub intro_end: Option<f64>,
    pub buildup_start: Option<f64>,
    pub drop_start: Option<f64>,
    pub outro_start: Option<f64>,
}

impl StructureMarkers {
    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }

    fn present(&self) -> Vec<f64> {
        [self.intro_end, self.buildup_start, self.drop_start, self.outro_start]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Whether the present markers are non-decreasing in section order.
    pub fn is_ordered(&self) -> bool {
        self.present().windows(2).all(|w| w[0] <= w[1])
    }

    pub fn shifted(&self, offset: f64) -> Self {
        self.map(|t| t + offset)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        self.map(|t| t * factor)
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            intro_end: self.intro_end.map(&f),
            buildup_start: self.buildup_start.map(&f),
            drop_start: self.drop_start.map(&f),
            outro_start: self.outro_start.map(&f),
        }
    }
}

fn moving_average(values: &[f32], radius: usize) -> Vec<f32> {
    let mut prefix = vec![0.0f64; values.len() + 1];
    for (i, &v) in values.iter().enumerate() {
        prefix[i + 1] = prefix[i] + v as f64;
    }
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(values.len());
            ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32
        })
        .collect()
}

fn percentile(values: &[f32], q: f64) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted[((sorted.len() - 1) as f64 * q).round() as usize]
}

pub fn detect_structure(
    energy: &EnergyProfile,
    grid: &BeatGrid,
    duration: f64,
    config: &StructureConfig,
) -> Diagnosed<StructureMarkers> {
    let mut result = Diagnosed::clean(StructureMarkers::default());
    let raw = energy.values();
    if raw.len() < 3 {
        result.note("track too short for structure detection");
        return result;
    }

    let hop = energy.hop_secs;
    let radius = ((config.smoothing_secs / hop / 2.0).round() as usize).max(1);
    let smoothed = moving_average(&raw, radius);

    let peak = smoothed.iter().copied().fold(0.0f32, f32::max);
    if peak <= 1e-6 {
        result.note("silent track; structure markers left absent");
        return result;
    }
    let floor = percentile(&smoothed, FLOOR_PERCENTILE);
    let range = peak - floor;
    if range / peak < config.min_dynamic_range {
        result.note(format!(
            "energy envelope too flat for structure detection (dynamic range {:.2})",
            range / peak
        ));
        return result;
    }
    let level = |fraction: f32| floor + fraction * range;

    let high = level(config.drop_threshold);
    let peak_regions = smoothed
        .windows(2)
        .filter(|w| w[0] < high && w[1] >= high)
        .count()
        + usize::from(smoothed[0] >= high);
    if peak_regions > config.max_peak_regions {
        result.note(format!(
            "energy envelope too irregular for structure detection ({peak_regions} peak regions)"
        ));
        return result;
    }

    let time = |i: usize| energy.points[i].time;
    let n = smoothed.len();

    let intro_idx = smoothed
        .iter()
        .position(|&v| v >= level(config.intro_threshold))
        .filter(|&i| i > 0);

    let sustain = ((config.min_sustain_secs / hop).round() as usize).max(1);
    let drop_idx = (0..n).find(|&i| {
        let end = (i + sustain).min(n);
        smoothed[i..end].iter().all(|&v| v >= high)
    });

    let buildup_idx = drop_idx.and_then(|drop| {
        let lower = intro_idx.unwrap_or(0);
        let tolerance = 0.01 * range;
        let mut j = drop;
        while j > lower
            && smoothed[j - 1] <= smoothed[j] + tolerance
            && smoothed[j - 1] > floor + tolerance
        {
            j -= 1;
        }
        ((drop - j) as f64 * hop >= MIN_BUILDUP_SECS).then_some(j)
    });

    let outro_idx = drop_idx.and_then(|drop| {
        let last_high = (drop..n).rev().find(|&i| smoothed[i] >= high)?;
        let below = level(config.outro_threshold);
        let first_low = (last_high + 1..n).find(|&i| smoothed[i] < below)?;
        smoothed[first_low..].iter().all(|&v| v < below).then_some(first_low)
    });

    let snap = |idx: Option<usize>| {
        idx.map(|i| {
            let t = time(i);
            grid.nearest_beat(t).unwrap_or(t).clamp(0.0, duration)
        })
    };

    let mut markers = StructureMarkers {
        intro_end: snap(intro_idx),
        buildup_start: snap(buildup_idx),
        drop_start: snap(drop_idx),
        outro_start: snap(outro_idx),
    };

    // Drop any marker that would precede an earlier section after snapping.
    let mut latest = f64::MIN;
    for slot in [
        &mut markers.intro_end,
        &mut markers.buildup_start,
        &mut markers.drop_start,
        &mut markers.outro_start,
    ] {
        if let Some(t) = *slot {
            if t < latest {
                *slot = None;
            } else {
                latest = t;
            }
        }
    }

    log::info!(
        "Structure: intro_end={:?} buildup={:?} drop={:?} outro={:?}",
        markers.intro_end, markers.buildup_start, markers.drop_start, markers.outro_start
    );
    if markers.is_empty() {
        result.note("no structural sections found");
    }
    result.value = markers;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::energy::EnergyPoint;

    fn profile(f: impl Fn(f64) -> f32, secs: f64) -> EnergyProfile {
        let hop = 0.1;
        let points = (0..(secs / hop) as usize)
            .map(|i| {
                let time = i as f64 * hop;
                EnergyPoint { time, rms: f(time) }
            })
            .collect();
        EnergyProfile { hop_secs: hop, points }
    }

    fn club_track(t: f64) -> f32 {
        match t {
            t if t < 16.0 => 0.1,
            t if t < 32.0 => 0.1 + 0.9 * ((t - 16.0) / 16.0) as f32,
            t if t < 80.0 => 1.0,
            _ => 0.2,
        }
    }

    fn on_beat(grid: &BeatGrid, t: f64) -> bool {
        grid.beats.iter().any(|&b| (b - t).abs() < 1e-9)
    }

    #[test]
    fn test_detects_ordered_sections() {
        let energy = profile(club_track, 120.0);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 120.0, 1.0);
        let markers = detect_structure(&energy, &grid, 120.0, &StructureConfig::default()).value;

        let intro = markers.intro_end.expect("intro end");
        let buildup = markers.buildup_start.expect("buildup start");
        let drop = markers.drop_start.expect("drop start");
        let outro = markers.outro_start.expect("outro start");

        assert!((15.0..=24.0).contains(&intro), "intro_end {intro}");
        assert!((15.0..=24.0).contains(&buildup), "buildup_start {buildup}");
        assert!((28.0..=34.0).contains(&drop), "drop_start {drop}");
        assert!((78.0..=84.0).contains(&outro), "outro_start {outro}");
        assert!(markers.is_ordered());
        for t in [intro, buildup, drop, outro] {
            assert!(on_beat(&grid, t), "{t} is not on a beat");
        }
    }

    #[test]
    fn test_flat_energy_leaves_markers_absent() {
        let energy = profile(|_| 0.5, 60.0);
        let grid = BeatGrid::from_tempo(128.0, 0.0, 60.0, 1.0);
        let result = detect_structure(&energy, &grid, 60.0, &StructureConfig::default());
        assert!(result.value.is_empty());
        assert!(!result.notes.is_empty());
    }

    #[test]
    fn test_irregular_energy_leaves_markers_absent() {
        // Alternating loud/quiet every 6 seconds.
        let energy = profile(|t| if (t / 6.0) as usize % 2 == 0 { 1.0 } else { 0.1 }, 120.0);
        let grid = BeatGrid::from_tempo(120.0, 0.0, 120.0, 1.0);
        let result = detect_structure(&energy, &grid, 120.0, &StructureConfig::default());
        assert!(result.value.is_empty(), "{:?}", result.value);
    }

    #[test]
    fn test_marker_shift_and_order_check() {
        let markers = StructureMarkers {
            intro_end: Some(10.0),
            buildup_start: None,
            drop_start: Some(30.0),
            outro_start: Some(90.0),
        };
        assert!(markers.is_ordered());
        let shifted = markers.shifted(5.0);
        assert_eq!(shifted.drop_start, Some(35.0));
        assert_eq!(shifted.buildup_start, None);

        let broken = StructureMarkers { drop_start: Some(5.0), ..markers };
        assert!(!broken.is_ordered());
    }
}

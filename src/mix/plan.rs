//! Mix planning: target tempo, per-pair transition lengths and styles, and the beat-aligned
//! points where each transition starts in the outgoing track and the incoming track.

use serde::Serialize;

use super::harmonic::{self, HarmonicVerdict};
use super::tempo::stretch_ratio;
use super::transition::TransitionStyle;
use crate::analysis::beat::{BeatGrid, BEATS_PER_BAR};
use crate::analysis::structure::StructureMarkers;
use crate::analysis::TrackAnalysis;
use crate::config::{Config, MixOptions};
use crate::error::{AnalysisError, Diagnosed, Result};

/// Shortenings below this are rounding at the track edge and go unreported.
const MIN_REPORTED_SHORTENING_SECS: f64 = 1e-3;

/// Length of `bars` bars of 4/4 at `bpm`, in seconds.
pub fn transition_seconds(bars: u32, bpm: f64) -> f64 {
    60.0 / bpm * BEATS_PER_BAR as f64 * bars as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub track_id: String,
    pub source_bpm: f64,
    /// `None` when tempo matching is off or the track is already within tolerance.
    pub stretch_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTransition {
    pub from: String,
    pub to: String,
    pub bars: u32,
    pub length_secs: f64,
    pub style: TransitionStyle,
    pub harmonic: HarmonicVerdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct MixPlan {
    pub target_bpm: f64,
    pub entries: Vec<PlanEntry>,
    pub transitions: Vec<PlannedTransition>,
}

pub fn build_plan(analyses: &[&TrackAnalysis], config: &Config) -> Result<Diagnosed<MixPlan>> {
    let Some(first) = analyses.first() else {
        return Err(AnalysisError::InvalidParameter("a mix needs at least one track".into()));
    };
    let options = &config.mix;
    let target_bpm = options.target_bpm.unwrap_or(first.beat_grid.bpm);
    if !(target_bpm.is_finite() && target_bpm > 0.0) {
        return Err(AnalysisError::InvalidParameter(format!("target tempo must be positive, got {target_bpm}")));
    }

    let mut plan = Diagnosed::clean(());
    let entries = analyses
        .iter()
        .map(|a| {
            let source_bpm = a.beat_grid.bpm;
            let needs_stretch = options.match_tempo && (target_bpm - source_bpm).abs() >= config.tempo.tolerance_bpm;
            PlanEntry {
                track_id: a.track_id.clone(),
                source_bpm,
                stretch_ratio: needs_stretch.then(|| stretch_ratio(source_bpm, target_bpm)),
            }
        })
        .collect::<Vec<_>>();

    let style = TransitionStyle::from_config(options.style, &config.transition);
    let transitions = analyses
        .windows(2)
        .map(|pair| {
            let (a, b) = (pair[0], pair[1]);
            // Without tempo matching the overlap runs at the outgoing track's tempo.
            let bpm = if options.match_tempo { target_bpm } else { a.beat_grid.bpm };
            let verdict = harmonic::check(&a.key, &b.key, config.key.confidence_threshold);
            if options.harmonic_mix && verdict.is_reportable_clash() {
                plan.warn(AnalysisError::HarmonicClash {
                    from: a.track_id.clone(),
                    from_key: verdict.from.clone(),
                    to: b.track_id.clone(),
                    to_key: verdict.to.clone(),
                });
            }
            PlannedTransition {
                from: a.track_id.clone(),
                to: b.track_id.clone(),
                bars: options.transition_bars,
                length_secs: transition_seconds(options.transition_bars, bpm),
                style,
                harmonic: verdict,
            }
        })
        .collect();

    log::info!("Mix plan: {} tracks at {:.2} BPM", analyses.len(), target_bpm);
    Ok(plan.map(|_| MixPlan {
        target_bpm,
        entries,
        transitions,
    }))
}

/// Beat grid and structure of a buffer, in that buffer's own timeline.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub duration_secs: f64,
    pub grid: BeatGrid,
    pub markers: StructureMarkers,
}

impl Timeline {
    /// Rescales after a time-stretch whose output is `factor` times as long as its input.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            duration_secs: self.duration_secs * factor,
            grid: self.grid.scaled(factor),
            markers: self.markers.scaled(factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransitionPoints {
    /// Where the overlap starts in the outgoing timeline.
    pub mix_out_secs: f64,
    /// Where the overlap starts in the incoming track.
    pub mix_in_secs: f64,
    /// Silence to prepend to the incoming track so its downbeats land on the outgoing ones.
    pub lead_in_secs: f64,
    pub length_secs: f64,
}

impl TransitionPoints {
    /// Offset that maps incoming-track time into the mixed timeline.
    pub fn incoming_offset(&self) -> f64 {
        self.mix_out_secs + self.lead_in_secs - self.mix_in_secs
    }

    /// Timeline of the mix after the transition, given both sides' timelines.
    pub fn merged_timeline(&self, incoming: &Timeline) -> Timeline {
        let offset = self.incoming_offset();
        let mut grid = incoming.grid.shifted(offset);
        grid.beats.retain(|&t| t >= self.mix_out_secs);
        Timeline {
            duration_secs: incoming.duration_secs + offset,
            grid,
            markers: incoming.markers.shifted(offset),
        }
    }
}

fn mix_out_point(outgoing: &Timeline, length: f64, options: &MixOptions) -> f64 {
    let nominal = match (options.auto_detect_transition, outgoing.markers.outro_start) {
        (true, Some(outro)) => outro,
        _ => outgoing.duration_secs - length,
    };
    if !options.sync_beats {
        return nominal.max(0.0);
    }
    let Some(mut snapped) = outgoing.grid.nearest_downbeat(nominal) else {
        return nominal.max(0.0);
    };
    let overflow = snapped + length - outgoing.duration_secs;
    // More than half a beat past the end: take the previous bar instead of eating the overlap.
    if overflow > outgoing.grid.beat_period() / 2.0 && snapped - outgoing.grid.bar_period() >= 0.0 {
        snapped -= outgoing.grid.bar_period();
    }
    snapped.max(0.0)
}

/// Picks the overlap start in both tracks.
///
/// With auto detection the outgoing track leaves at its outro and the incoming track enters
/// so its intro ends with the overlap. Otherwise the overlap covers the outgoing track's last
/// `length_secs` and the incoming track's opening. With beat sync both points land on
/// downbeats; a slightly negative incoming downbeat becomes a lead-in of silence.
pub fn transition_points(
    outgoing: &Timeline,
    incoming: &Timeline,
    length_secs: f64,
    options: &MixOptions,
) -> Diagnosed<TransitionPoints> {
    let mut result = Diagnosed::clean(());
    let mut length = length_secs.min(outgoing.duration_secs).min(incoming.duration_secs).max(0.0);

    let mix_out = mix_out_point(outgoing, length, options);
    if mix_out + length > outgoing.duration_secs {
        length = outgoing.duration_secs - mix_out;
    }

    let mut mix_in = match (options.auto_detect_transition, incoming.markers.intro_end) {
        (true, Some(intro_end)) => (intro_end - length).max(0.0),
        _ => 0.0,
    };
    let mut lead_in = 0.0;
    if options.sync_beats {
        let lattice = incoming.grid.downbeat_lattice_near(mix_in);
        if lattice >= 0.0 {
            mix_in = lattice;
        } else if -lattice <= incoming.grid.beat_period() {
            mix_in = 0.0;
            lead_in = -lattice;
        } else {
            mix_in = lattice + incoming.grid.bar_period();
        }
    }

    let available = incoming.duration_secs - mix_in + lead_in;
    if length > available {
        length = available.max(0.0);
    }
    if length_secs - length >= MIN_REPORTED_SHORTENING_SECS {
        result.note(format!(
            "transition shortened from {:.2}s to {:.2}s to fit the material",
            length_secs, length
        ));
    }

    log::debug!(
        "Transition points: out {:.3}s, in {:.3}s, lead-in {:.3}s, length {:.3}s",
        mix_out, mix_in, lead_in, length
    );
    result.map(|_| TransitionPoints {
        mix_out_secs: mix_out,
        mix_in_secs: mix_in,
        lead_in_secs: lead_in,
        length_secs: length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::energy::EnergyProfile;
    use crate::analysis::key::{KeyEstimate, Mode};

    fn analysis(id: &str, bpm: f64, pitch_class: u8, mode: Mode, key_confidence: f32) -> TrackAnalysis {
        TrackAnalysis {
            track_id: id.to_string(),
            sample_rate: 44100,
            duration_secs: 180.0,
            beat_grid: BeatGrid::from_tempo(bpm, 0.0, 180.0, 0.9),
            key: KeyEstimate {
                pitch_class,
                mode,
                confidence: key_confidence,
            },
            energy: EnergyProfile {
                hop_secs: 0.1,
                points: Vec::new(),
            },
            structure: StructureMarkers::default(),
            warnings: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn harmonic_config(harmonic_mix: bool) -> Config {
        let mut config = Config::default();
        config.mix.harmonic_mix = harmonic_mix;
        config
    }

    fn timeline(bpm: f64, offset: f64, duration: f64, markers: StructureMarkers) -> Timeline {
        Timeline {
            duration_secs: duration,
            grid: BeatGrid::from_tempo(bpm, offset, duration, 0.9),
            markers,
        }
    }

    fn options(sync_beats: bool, auto: bool) -> MixOptions {
        MixOptions {
            sync_beats,
            auto_detect_transition: auto,
            ..MixOptions::default()
        }
    }

    #[test]
    fn test_transition_seconds() {
        assert!((transition_seconds(16, 128.0) - 30.0).abs() < 1e-9);
        assert!((transition_seconds(8, 120.0) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_targets_first_track_tempo() {
        let a = analysis("a", 120.0, 9, Mode::Minor, 0.8);
        let b = analysis("b", 126.0, 9, Mode::Minor, 0.8);
        let plan = build_plan(&[&a, &b], &harmonic_config(true)).unwrap();
        assert_eq!(plan.value.target_bpm, 120.0);
        assert_eq!(plan.value.entries[0].stretch_ratio, None);
        assert!(plan.value.entries[1].stretch_ratio.is_some());
        assert_eq!(plan.value.transitions.len(), 1);
        assert!((plan.value.transitions[0].length_secs - transition_seconds(16, 120.0)).abs() < 1e-9);
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);
    }

    #[test]
    fn test_confident_clash_is_a_warning() {
        // A minor (8A) into F# major (2B).
        let a = analysis("a", 128.0, 9, Mode::Minor, 0.8);
        let b = analysis("b", 128.0, 6, Mode::Major, 0.8);
        let plan = build_plan(&[&a, &b], &harmonic_config(true)).unwrap();
        assert_eq!(plan.value.transitions[0].harmonic.compatibility, harmonic::Compatibility::Clash);
        assert!(matches!(
            plan.warnings.as_slice(),
            [AnalysisError::HarmonicClash { from, to, .. }] if from == "a" && to == "b"
        ));
        assert_eq!(plan.warnings[0].code(), "harmonic_clash");
        assert!(plan.notes.is_empty(), "{:?}", plan.notes);
    }

    #[test]
    fn test_clash_ignored_without_harmonic_mixing() {
        let a = analysis("a", 128.0, 9, Mode::Minor, 0.8);
        let b = analysis("b", 128.0, 6, Mode::Major, 0.8);
        let plan = build_plan(&[&a, &b], &harmonic_config(false)).unwrap();
        assert_eq!(plan.value.transitions[0].harmonic.compatibility, harmonic::Compatibility::Clash);
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);
    }

    #[test]
    fn test_low_key_confidence_suppresses_clash() {
        let a = analysis("a", 128.0, 9, Mode::Minor, 0.8);
        let b = analysis("b", 128.0, 6, Mode::Major, 0.01);
        let plan = build_plan(&[&a, &b], &harmonic_config(true)).unwrap();
        assert!(!plan.value.transitions[0].harmonic.reliable);
        assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);
    }

    #[test]
    fn test_defaults_without_markers() {
        let a = timeline(128.0, 0.0, 180.0, StructureMarkers::default());
        let b = timeline(128.0, 0.0, 180.0, StructureMarkers::default());
        let points = transition_points(&a, &b, 30.0, &options(true, true));
        assert!(points.notes.is_empty());
        assert!((points.value.mix_out_secs - 150.0).abs() < 1e-6);
        assert_eq!(points.value.mix_in_secs, 0.0);
        assert_eq!(points.value.lead_in_secs, 0.0);
        assert!((points.value.length_secs - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_markers_drive_points_in_auto_mode() {
        let outro = StructureMarkers { outro_start: Some(150.5), ..StructureMarkers::default() };
        let intro = StructureMarkers { intro_end: Some(40.0), ..StructureMarkers::default() };
        let a = timeline(128.0, 0.0, 200.0, outro);
        let b = timeline(128.0, 0.0, 200.0, intro);

        let points = transition_points(&a, &b, 30.0, &options(true, true)).value;
        // 150.5s is closest to the downbeat at 80 bars (150.0s).
        assert!((points.mix_out_secs - 150.0).abs() < 1e-6);
        // intro end minus the overlap is 10s, whose nearest downbeat is bar 5 (9.375s).
        assert!((points.mix_in_secs - 9.375).abs() < 1e-6);

        let manual = transition_points(&a, &b, 30.0, &options(false, false)).value;
        assert!((manual.mix_out_secs - 170.0).abs() < 1e-9);
        assert_eq!(manual.mix_in_secs, 0.0);
    }

    #[test]
    fn test_small_negative_downbeat_becomes_lead_in() {
        let a = timeline(120.0, 0.0, 60.0, StructureMarkers::default());
        let b = timeline(120.0, 1.8, 60.0, StructureMarkers::default());
        let points = transition_points(&a, &b, 8.0, &options(true, false)).value;
        assert_eq!(points.mix_in_secs, 0.0);
        assert!((points.lead_in_secs - 0.2).abs() < 1e-9);
        // B's first downbeat (1.8s) lands on A's mix-out downbeat plus one bar.
        let merged = points.merged_timeline(&b);
        assert!((merged.grid.downbeat_offset - (points.mix_out_secs + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_large_negative_downbeat_skips_to_next_bar() {
        let a = timeline(120.0, 0.0, 60.0, StructureMarkers::default());
        let b = timeline(120.0, 1.0, 60.0, StructureMarkers::default());
        let points = transition_points(&a, &b, 8.0, &options(true, false)).value;
        assert!((points.mix_in_secs - 1.0).abs() < 1e-9);
        assert_eq!(points.lead_in_secs, 0.0);
    }

    #[test]
    fn test_overlap_longer_than_track_is_shortened() {
        let a = timeline(120.0, 0.0, 10.0, StructureMarkers::default());
        let b = timeline(120.0, 0.0, 60.0, StructureMarkers::default());
        let points = transition_points(&a, &b, 16.0, &options(true, false));
        assert!(points.value.length_secs <= 10.0);
        assert!(points.value.mix_out_secs + points.value.length_secs <= 10.0 + 1e-9);
        assert_eq!(points.notes.len(), 1);
    }

    #[test]
    fn test_sub_millisecond_overflow_is_not_reported() {
        // The last downbeat before the end sits half a millisecond too late for a full overlap.
        let a = timeline(120.0, 0.0, 59.9995, StructureMarkers::default());
        let b = timeline(120.0, 0.0, 60.0, StructureMarkers::default());
        let points = transition_points(&a, &b, 8.0, &options(true, false));
        assert!((points.value.mix_out_secs - 52.0).abs() < 1e-9);
        assert!((points.value.length_secs - 7.9995).abs() < 1e-6);
        assert!(points.notes.is_empty(), "{:?}", points.notes);
    }

    #[test]
    fn test_merged_timeline_places_incoming_after_mix_out() {
        let b = timeline(128.0, 0.0, 180.0, StructureMarkers { outro_start: Some(160.0), ..StructureMarkers::default() });
        let points = TransitionPoints {
            mix_out_secs: 150.0,
            mix_in_secs: 0.0,
            lead_in_secs: 0.0,
            length_secs: 30.0,
        };
        let merged = points.merged_timeline(&b);
        assert!((merged.duration_secs - 330.0).abs() < 1e-9);
        assert_eq!(merged.markers.outro_start, Some(310.0));
        assert!(merged.grid.beats.iter().all(|&t| t >= 150.0));
    }
}

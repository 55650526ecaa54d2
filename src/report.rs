//! Diagnostics returned with every job: per-track analysis, planned transitions and the
//! warnings and notes collected along the way.

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::analysis::energy::EnergySummary;
use crate::analysis::structure::StructureMarkers;
use crate::analysis::TrackAnalysis;
use crate::error::AnalysisError;
use crate::mix::harmonic::HarmonicVerdict;
use crate::mix::loop_extend::LoopPoints;
use crate::mix::plan::{PlannedTransition, TransitionPoints};
use crate::mix::transition::StyleName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Analyze,
    Mix,
    Extend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportWarning {
    pub code: &'static str,
    pub track: Option<String>,
    pub message: String,
}

impl ReportWarning {
    pub fn new(error: &AnalysisError, track: Option<&str>) -> Self {
        Self {
            code: error.code(),
            track: track.map(str::to_string),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub track_id: String,
    pub duration_secs: f64,
    pub bpm: f64,
    pub beat_confidence: f32,
    pub key: String,
    pub camelot: String,
    pub key_confidence: f32,
    pub energy: EnergySummary,
    pub structure: StructureMarkers,
}

impl From<&TrackAnalysis> for TrackReport {
    fn from(analysis: &TrackAnalysis) -> Self {
        Self {
            track_id: analysis.track_id.clone(),
            duration_secs: analysis.duration_secs,
            bpm: analysis.beat_grid.bpm,
            beat_confidence: analysis.beat_grid.confidence,
            key: analysis.key.name(),
            camelot: analysis.key.camelot().to_string(),
            key_confidence: analysis.key.confidence,
            energy: analysis.energy.summary(),
            structure: analysis.structure,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub from: String,
    pub to: String,
    pub style: StyleName,
    pub bars: u32,
    pub length_secs: f64,
    pub mix_out_secs: f64,
    pub mix_in_secs: f64,
    pub harmonic: HarmonicVerdict,
}

impl TransitionReport {
    pub fn new(planned: &PlannedTransition, points: &TransitionPoints) -> Self {
        Self {
            from: planned.from.clone(),
            to: planned.to.clone(),
            style: planned.style.name(),
            bars: planned.bars,
            length_secs: points.length_secs,
            mix_out_secs: points.mix_out_secs,
            mix_in_secs: points.mix_in_secs - points.lead_in_secs,
            harmonic: planned.harmonic.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub mode: JobMode,
    pub tracks: Vec<TrackReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bpm: Option<f64>,
    pub transitions: Vec<TransitionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_points: Option<LoopPoints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_duration_secs: Option<f64>,
    pub warnings: Vec<ReportWarning>,
    pub notes: Vec<String>,
}

impl DiagnosticsReport {
    pub fn new(mode: JobMode) -> Self {
        Self {
            mode,
            tracks: Vec::new(),
            target_bpm: None,
            transitions: Vec::new(),
            loop_points: None,
            output_duration_secs: None,
            warnings: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Adds a track and the diagnostics its analysis produced.
    pub fn add_track(&mut self, analysis: &TrackAnalysis) {
        self.tracks.push(TrackReport::from(analysis));
        self.warnings
            .extend(analysis.warnings.iter().map(|w| ReportWarning::new(w, Some(&analysis.track_id))));
        self.notes
            .extend(analysis.notes.iter().map(|n| format!("{}: {}", analysis.track_id, n)));
    }

    pub fn add_diagnostics(&mut self, warnings: &[AnalysisError], notes: &[String], track: Option<&str>) {
        self.warnings.extend(warnings.iter().map(|w| ReportWarning::new(w, track)));
        self.notes.extend(notes.iter().map(|n| match track {
            Some(id) => format!("{id}: {n}"),
            None => n.clone(),
        }));
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

fn marker(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |t| format!("{t:.2}s"))
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for track in &self.tracks {
            writeln!(f, "{}", track.track_id)?;
            writeln!(f, "  Duration:   {:.1}s", track.duration_secs)?;
            writeln!(f, "  Tempo:      {:.2} BPM (confidence {:.2})", track.bpm, track.beat_confidence)?;
            writeln!(
                f,
                "  Key:        {} / {} (confidence {:.2})",
                track.key, track.camelot, track.key_confidence
            )?;
            writeln!(
                f,
                "  Energy:     average {:.2}, peak {:.3}",
                track.energy.average, track.energy.peak
            )?;
            let s = &track.structure;
            writeln!(
                f,
                "  Structure:  intro end {}, buildup {}, drop {}, outro {}",
                marker(s.intro_end),
                marker(s.buildup_start),
                marker(s.drop_start),
                marker(s.outro_start)
            )?;
        }

        if let Some(bpm) = self.target_bpm {
            writeln!(f, "Target tempo: {bpm:.2} BPM")?;
        }
        for t in &self.transitions {
            writeln!(
                f,
                "Transition {} -> {}: {:?}, {} bars ({:.2}s) at {:.2}s, harmonic {:?} ({} -> {})",
                t.from, t.to, t.style, t.bars, t.length_secs, t.mix_out_secs, t.harmonic.compatibility, t.harmonic.from, t.harmonic.to
            )?;
        }
        if let Some(lp) = &self.loop_points {
            writeln!(
                f,
                "Loop: {:.2}s -> {:.2}s ({} bars, similarity {:.3})",
                lp.start_secs, lp.end_secs, lp.bars, lp.similarity
            )?;
        }
        if let Some(d) = self.output_duration_secs {
            writeln!(f, "Output duration: {d:.1}s")?;
        }
        for w in &self.warnings {
            match &w.track {
                Some(track) => writeln!(f, "warning [{}] {}: {}", w.code, track, w.message)?,
                None => writeln!(f, "warning [{}] {}", w.code, w.message)?,
            }
        }
        for n in &self.notes {
            writeln!(f, "note: {n}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_carries_stable_code() {
        let err = AnalysisError::LowConfidenceKey { camelot: "8A".into(), confidence: 0.1 };
        let w = ReportWarning::new(&err, Some("intro.wav"));
        assert_eq!(w.code, "low_confidence_key");
        assert_eq!(w.track.as_deref(), Some("intro.wav"));
        assert!(w.message.contains("8A"));
    }

    #[test]
    fn test_json_omits_absent_sections() {
        let mut report = DiagnosticsReport::new(JobMode::Analyze);
        report.add_diagnostics(&[], &["tempo match skipped".to_string()], Some("b"));
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["mode"], "analyze");
        assert!(value.get("loop_points").is_none());
        assert_eq!(value["notes"][0], "b: tempo match skipped");
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_write_json_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = DiagnosticsReport::new(JobMode::Mix);
        report.output_duration_secs = Some(330.0);
        report.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"output_duration_secs\": 330.0"));
    }
}

//! Job sequencing: analysis, planning, tempo matching, then transitions or loop extension.
//!
//! A job owns its input buffers and hands each one to the next stage by value. The only
//! state shared between jobs is the read-only configuration, so one orchestrator can run
//! several jobs from different threads.

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::analysis::{analyze_track, TrackAnalysis};
use crate::audio::resample::resample_to;
use crate::audio::WaveformBuffer;
use crate::config::Config;
use crate::error::{AnalysisError, Diagnosed, Result};
use crate::mix::loop_extend::extend_track;
use crate::mix::plan::{build_plan, transition_points, MixPlan, Timeline};
use crate::mix::tempo::match_tempo;
use crate::mix::transition::{render_transition, TransitionRequest};
use crate::report::{DiagnosticsReport, JobMode, TransitionReport};

/// A decoded input. Tracks sharing an id are analysed once per job.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub buffer: WaveformBuffer,
}

impl Track {
    pub fn new(id: impl Into<String>, buffer: WaveformBuffer) -> Self {
        Self { id: id.into(), buffer }
    }
}

#[derive(Debug, Clone)]
pub enum JobRequest {
    Analyze { tracks: Vec<Track> },
    Mix { tracks: Vec<Track> },
    Extend { track: Track, target_secs: f64 },
}

/// Stage boundaries at which progress is reported and cancellation is checked.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStage {
    Analysis { tracks: usize },
    Planning,
    Preparing { track: String },
    Transition { index: usize, total: usize },
    LoopExtension,
    Finalizing,
}

impl JobStage {
    pub fn label(&self) -> String {
        match self {
            JobStage::Analysis { tracks } => format!("analysis of {tracks} track(s)"),
            JobStage::Planning => "planning".to_string(),
            JobStage::Preparing { track } => format!("preparing '{track}'"),
            JobStage::Transition { index, total } => format!("transition {index}/{total}"),
            JobStage::LoopExtension => "loop extension".to_string(),
            JobStage::Finalizing => "finalizing".to_string(),
        }
    }
}

/// Shared flag a caller flips to abort a running job at its next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct JobOutput {
    /// `None` for analysis-only jobs.
    pub buffer: Option<WaveformBuffer>,
    pub report: DiagnosticsReport,
}

/// Parses durations such as `30m`, `1h`, `300s`, `1h30m` or a bare number of seconds.
pub fn parse_target_duration(text: &str) -> Result<f64> {
    let invalid = || AnalysisError::InvalidParameter(format!("invalid duration '{text}'"));
    let trimmed = text.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        return if secs.is_finite() && secs > 0.0 { Ok(secs) } else { Err(invalid()) };
    }

    let mut total = 0.0;
    let mut number = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return Err(invalid()),
        };
        let value: f64 = number.parse().map_err(|_| invalid())?;
        total += value * unit;
        number.clear();
    }
    if !number.is_empty() || total <= 0.0 {
        return Err(invalid());
    }
    Ok(total)
}

pub struct MixOrchestrator {
    config: Arc<Config>,
}

impl MixOrchestrator {
    pub fn new(config: Config) -> Self {
        Self { config: Arc::new(config) }
    }

    pub fn with_shared_config(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run(&self, request: JobRequest) -> Result<JobOutput> {
        self.run_with(request, &CancellationToken::new(), &|_| {})
    }

    pub fn run_with(
        &self,
        request: JobRequest,
        cancel: &CancellationToken,
        on_stage: &(dyn Fn(&JobStage) + Sync),
    ) -> Result<JobOutput> {
        let mut job = Job {
            config: &self.config,
            cancel,
            on_stage,
            started: Instant::now(),
            cache: HashMap::new(),
        };
        let analyze_only = self.config.mix.analyze_only;
        match request {
            JobRequest::Analyze { tracks } => job.analyze_only(tracks),
            JobRequest::Mix { tracks } if analyze_only => job.analyze_only(tracks),
            JobRequest::Extend { track, .. } if analyze_only => job.analyze_only(vec![track]),
            JobRequest::Mix { tracks } => job.mix(tracks),
            JobRequest::Extend { track, target_secs } => job.extend(track, target_secs),
        }
    }
}

struct Job<'a> {
    config: &'a Config,
    cancel: &'a CancellationToken,
    on_stage: &'a (dyn Fn(&JobStage) + Sync),
    started: Instant,
    /// Analyses keyed by track id; dropped with the job.
    cache: HashMap<String, Arc<TrackAnalysis>>,
}

impl Job<'_> {
    fn checkpoint(&self, stage: JobStage) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::warn!("Job cancelled before {}", stage.label());
            return Err(AnalysisError::Cancelled(stage.label()));
        }
        if let Some(limit) = self.config.job.timeout_secs {
            if self.started.elapsed().as_secs_f64() > limit {
                return Err(AnalysisError::TimedOut(limit));
            }
        }
        log::info!("Stage: {}", stage.label());
        (self.on_stage)(&stage);
        Ok(())
    }

    fn analyze(&mut self, tracks: &[Track]) -> Result<Vec<Arc<TrackAnalysis>>> {
        if tracks.is_empty() {
            return Err(AnalysisError::InvalidParameter("no input tracks".into()));
        }
        for track in tracks {
            if track.buffer.frames() == 0 {
                return Err(AnalysisError::UnsupportedInput(format!("track '{}' contains no audio", track.id)));
            }
        }

        let mut pending: Vec<&Track> = Vec::new();
        for track in tracks {
            if !self.cache.contains_key(&track.id) && !pending.iter().any(|p| p.id == track.id) {
                pending.push(track);
            }
        }
        self.checkpoint(JobStage::Analysis { tracks: pending.len() })?;

        let config = self.config;
        let fresh = pending
            .par_iter()
            .map(|t| analyze_track(&t.id, &t.buffer, config))
            .collect::<Result<Vec<_>>>()?;
        for analysis in fresh {
            self.cache.insert(analysis.track_id.clone(), Arc::new(analysis));
        }

        tracks
            .iter()
            .map(|t| {
                self.cache
                    .get(&t.id)
                    .cloned()
                    .ok_or_else(|| AnalysisError::UnsupportedInput(format!("missing analysis for '{}'", t.id)))
            })
            .collect()
    }

    fn report_for(&self, mode: JobMode, analyses: &[Arc<TrackAnalysis>]) -> Result<DiagnosticsReport> {
        let mut report = DiagnosticsReport::new(mode);
        let mut seen: Vec<&str> = Vec::new();
        for analysis in analyses {
            if seen.contains(&analysis.track_id.as_str()) {
                continue;
            }
            seen.push(&analysis.track_id);
            report.add_track(analysis);
        }
        if mode == JobMode::Analyze && self.config.mix.strict {
            if let Some(first) = analyses.iter().flat_map(|a| a.warnings.iter()).next() {
                log::error!("Strict mode: failing on {}", first);
                return Err(first.clone());
            }
        }
        Ok(report)
    }

    fn analyze_only(&mut self, tracks: Vec<Track>) -> Result<JobOutput> {
        let analyses = self.analyze(&tracks)?;
        let report = self.report_for(JobMode::Analyze, &analyses)?;
        Ok(JobOutput { buffer: None, report })
    }

    /// Brings a track to the job's sample rate and channel layout, then to the plan's tempo.
    fn prepare(
        &self,
        track: Track,
        analysis: &TrackAnalysis,
        plan: &MixPlan,
        sample_rate: u32,
        channels: usize,
        report: &mut DiagnosticsReport,
    ) -> Result<(WaveformBuffer, Timeline)> {
        self.checkpoint(JobStage::Preparing { track: track.id.clone() })?;
        let buffer = resample_to(track.buffer, sample_rate)?.with_channel_count(channels);
        let timeline = Timeline {
            duration_secs: buffer.duration_secs(),
            grid: analysis.beat_grid.clone(),
            markers: analysis.structure,
        };
        if !self.config.mix.match_tempo {
            return Ok((buffer, timeline));
        }

        let original = buffer.duration_secs();
        let stretched = match_tempo(buffer, analysis.beat_grid.bpm, plan.target_bpm, &self.config.tempo)?;
        report.add_diagnostics(&stretched.warnings, &stretched.notes, Some(&track.id));
        let factor = if original > 0.0 { stretched.value.duration_secs() / original } else { 1.0 };
        let timeline = if (factor - 1.0).abs() > 1e-9 { timeline.scaled(factor) } else { timeline };
        Ok((stretched.value, timeline))
    }

    fn mix(&mut self, tracks: Vec<Track>) -> Result<JobOutput> {
        if tracks.len() < 2 {
            return Err(AnalysisError::InvalidParameter(format!(
                "a mix needs at least two tracks, got {}",
                tracks.len()
            )));
        }
        let analyses = self.analyze(&tracks)?;
        let mut report = self.report_for(JobMode::Mix, &analyses)?;

        self.checkpoint(JobStage::Planning)?;
        let refs: Vec<&TrackAnalysis> = analyses.iter().map(|a| a.as_ref()).collect();
        let plan = build_plan(&refs, self.config)?;
        report.add_diagnostics(&plan.warnings, &plan.notes, None);
        let plan = plan.value;
        report.target_bpm = Some(plan.target_bpm);

        let sample_rate = tracks[0].buffer.sample_rate();
        let channels = tracks.iter().map(|t| t.buffer.channel_count()).max().unwrap_or(1);
        let total = tracks.len() - 1;

        let mut inputs = tracks.into_iter().zip(analyses.iter());
        let Some((first, first_analysis)) = inputs.next() else {
            return Err(AnalysisError::InvalidParameter("no input tracks".into()));
        };
        let (mut mixed, mut timeline) = self.prepare(first, first_analysis, &plan, sample_rate, channels, &mut report)?;

        for (index, ((track, analysis), planned)) in inputs.zip(&plan.transitions).enumerate() {
            let track_id = track.id.clone();
            let (incoming, incoming_timeline) = self.prepare(track, analysis, &plan, sample_rate, channels, &mut report)?;
            self.checkpoint(JobStage::Transition { index: index + 1, total })?;

            let points = transition_points(&timeline, &incoming_timeline, planned.length_secs, &self.config.mix);
            report.add_diagnostics(&points.warnings, &points.notes, Some(&track_id));
            let points = points.value;

            let outgoing = mixed.truncated(
                (timeline.duration_secs.min(points.mix_out_secs + points.length_secs) * sample_rate as f64).round()
                    as usize,
            );
            let lead_in = incoming.frames_for_secs(points.lead_in_secs);
            let incoming = incoming
                .with_leading_silence(lead_in)
                .slice(incoming_frames(points.mix_in_secs, sample_rate), usize::MAX);

            let request = TransitionRequest {
                style: planned.style,
                length_secs: points.length_secs,
                confidence_a: timeline.grid.confidence,
                confidence_b: incoming_timeline.grid.confidence,
                min_alignment_confidence: self.config.transition.min_alignment_confidence,
            };
            let rendered = render_transition(outgoing, incoming, &request)?;
            report.add_diagnostics(&rendered.warnings, &rendered.notes, Some(&track_id));
            report.transitions.push(TransitionReport::new(planned, &points));

            mixed = rendered.value;
            timeline = points.merged_timeline(&incoming_timeline);
        }

        let mixed = self.finalize(mixed, &mut report)?;
        Ok(JobOutput { buffer: Some(mixed), report })
    }

    fn extend(&mut self, track: Track, target_secs: f64) -> Result<JobOutput> {
        let limit = self.config.job.max_target_secs;
        if target_secs > limit {
            return Err(AnalysisError::InvalidParameter(format!(
                "target duration {target_secs:.0}s exceeds the {limit:.0}s limit"
            )));
        }
        let analyses = self.analyze(std::slice::from_ref(&track))?;
        let mut report = self.report_for(JobMode::Extend, &analyses)?;

        self.checkpoint(JobStage::LoopExtension)?;
        let grid = &analyses[0].beat_grid;
        let extended: Diagnosed<_> = extend_track(&track.buffer, grid, target_secs, &self.config.looping)?;
        report.add_diagnostics(&extended.warnings, &extended.notes, Some(&track.id));
        report.loop_points = extended.value.loop_points;

        let buffer = self.finalize(extended.value.buffer, &mut report)?;
        Ok(JobOutput { buffer: Some(buffer), report })
    }

    fn finalize(&self, mut buffer: WaveformBuffer, report: &mut DiagnosticsReport) -> Result<WaveformBuffer> {
        self.checkpoint(JobStage::Finalizing)?;
        if self.config.output.normalize {
            buffer.normalize_loudness(self.config.output.target_rms_db);
        }
        report.output_duration_secs = Some(buffer.duration_secs());
        log::info!("Output: {:.1}s, {} ch, {} Hz", buffer.duration_secs(), buffer.channel_count(), buffer.sample_rate());
        Ok(buffer)
    }
}

fn incoming_frames(secs: f64, sample_rate: u32) -> usize {
    (secs.max(0.0) * sample_rate as f64).round() as usize
}

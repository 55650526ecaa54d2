use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::mix::transition::{CrossfadeShape, StyleName};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mix: MixOptions,
    #[serde(default)]
    pub beat: BeatConfig,
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub structure: StructureConfig,
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default, rename = "loop")]
    pub looping: LoopConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub job: JobConfig,
}

/// Feature flags of a mix job. The CLI flags of the same names override these.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MixOptions {
    #[serde(default = "default_true")]
    pub sync_beats: bool,
    #[serde(default = "default_true")]
    pub match_tempo: bool,
    #[serde(default = "default_true")]
    pub harmonic_mix: bool,
    /// Pick transition points from detected structure instead of the fixed defaults.
    #[serde(default = "default_true")]
    pub auto_detect_transition: bool,
    #[serde(default = "default_transition_bars")]
    pub transition_bars: u32,
    #[serde(default)]
    pub style: StyleName,
    /// Overrides the first track's tempo as the mix target.
    #[serde(default)]
    pub target_bpm: Option<f64>,
    #[serde(default)]
    pub analyze_only: bool,
    /// Treat recoverable analysis warnings as fatal in analyze-only jobs.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeatConfig {
    #[serde(default = "default_min_bpm")]
    pub min_bpm: f64,
    #[serde(default = "default_max_bpm")]
    pub max_bpm: f64,
    #[serde(default = "default_beat_confidence")]
    pub confidence_threshold: f32,
    /// Tempo assumed when no periodicity can be found at all.
    #[serde(default = "default_fallback_bpm")]
    pub fallback_bpm: f64,
    /// A harmonic candidate this strong relative to the winner triggers the inter-onset tie-break.
    #[serde(default = "default_octave_strength_ratio")]
    pub octave_strength_ratio: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyConfig {
    #[serde(default = "default_key_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_chroma_min_hz")]
    pub min_freq_hz: f32,
    #[serde(default = "default_chroma_max_hz")]
    pub max_freq_hz: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnergyConfig {
    /// RMS window and hop of the energy curve.
    #[serde(default = "default_energy_hop")]
    pub hop_secs: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StructureConfig {
    #[serde(default = "default_smoothing_secs")]
    pub smoothing_secs: f64,
    /// Minimum (peak - floor) / peak of the smoothed envelope for markers to be placed.
    #[serde(default = "default_min_dynamic_range")]
    pub min_dynamic_range: f32,
    #[serde(default = "default_intro_threshold")]
    pub intro_threshold: f32,
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f32,
    #[serde(default = "default_outro_threshold")]
    pub outro_threshold: f32,
    #[serde(default = "default_min_sustain_secs")]
    pub min_sustain_secs: f64,
    /// More separate near-peak regions than this marks the envelope as too irregular.
    #[serde(default = "default_max_peak_regions")]
    pub max_peak_regions: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TempoConfig {
    /// Stretch ratios further than this from 1.0 raise a tempo-mismatch warning.
    #[serde(default = "default_max_stretch_deviation")]
    pub max_stretch_deviation: f64,
    /// BPM differences below this are left unstretched.
    #[serde(default = "default_tolerance_bpm")]
    pub tolerance_bpm: f64,
    #[serde(default = "default_wsola_frame_secs")]
    pub frame_secs: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransitionConfig {
    #[serde(default)]
    pub shape: CrossfadeShape,
    #[serde(default = "default_bass_cutoff")]
    pub bass_cutoff_hz: f32,
    /// Length of the low-band swap as a fraction of the transition.
    #[serde(default = "default_bass_swap_fraction")]
    pub bass_swap_fraction: f32,
    #[serde(default = "default_beat_confidence")]
    pub min_alignment_confidence: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopConfig {
    #[serde(default = "default_min_loop_secs")]
    pub min_loop_secs: f64,
    #[serde(default = "default_max_loop_bars")]
    pub max_loop_bars: u32,
    #[serde(default = "default_min_loop_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_seam_beats")]
    pub seam_beats: u32,
    #[serde(default = "default_compare_beats")]
    pub compare_beats: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_target_rms_db")]
    pub target_rms_db: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Longest output an extension job may ask for.
    #[serde(default = "default_max_target_secs")]
    pub max_target_secs: f64,
}

impl Default for MixOptions {
    fn default() -> Self {
        Self {
            sync_beats: true,
            match_tempo: true,
            harmonic_mix: true,
            auto_detect_transition: true,
            transition_bars: default_transition_bars(),
            style: StyleName::default(),
            target_bpm: None,
            analyze_only: false,
            strict: false,
        }
    }
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
            confidence_threshold: default_beat_confidence(),
            fallback_bpm: default_fallback_bpm(),
            octave_strength_ratio: default_octave_strength_ratio(),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_key_confidence(),
            min_freq_hz: default_chroma_min_hz(),
            max_freq_hz: default_chroma_max_hz(),
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            hop_secs: default_energy_hop(),
        }
    }
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            smoothing_secs: default_smoothing_secs(),
            min_dynamic_range: default_min_dynamic_range(),
            intro_threshold: default_intro_threshold(),
            drop_threshold: default_drop_threshold(),
            outro_threshold: default_outro_threshold(),
            min_sustain_secs: default_min_sustain_secs(),
            max_peak_regions: default_max_peak_regions(),
        }
    }
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            max_stretch_deviation: default_max_stretch_deviation(),
            tolerance_bpm: default_tolerance_bpm(),
            frame_secs: default_wsola_frame_secs(),
        }
    }
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            shape: CrossfadeShape::default(),
            bass_cutoff_hz: default_bass_cutoff(),
            bass_swap_fraction: default_bass_swap_fraction(),
            min_alignment_confidence: default_beat_confidence(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_loop_secs: default_min_loop_secs(),
            max_loop_bars: default_max_loop_bars(),
            min_similarity: default_min_loop_similarity(),
            seam_beats: default_seam_beats(),
            compare_beats: default_compare_beats(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_target_secs: default_max_target_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            target_rms_db: default_target_rms_db(),
        }
    }
}

fn default_true() -> bool { true }
fn default_transition_bars() -> u32 { 16 }
fn default_min_bpm() -> f64 { 70.0 }
fn default_max_bpm() -> f64 { 180.0 }
fn default_beat_confidence() -> f32 { 0.35 }
fn default_fallback_bpm() -> f64 { 120.0 }
fn default_octave_strength_ratio() -> f32 { 0.8 }
fn default_key_confidence() -> f32 { 0.3 }
fn default_chroma_min_hz() -> f32 { 100.0 }
fn default_chroma_max_hz() -> f32 { 4000.0 }
fn default_energy_hop() -> f64 { 0.1 }
fn default_smoothing_secs() -> f64 { 4.0 }
fn default_min_dynamic_range() -> f32 { 0.25 }
fn default_intro_threshold() -> f32 { 0.3 }
fn default_drop_threshold() -> f32 { 0.85 }
fn default_outro_threshold() -> f32 { 0.5 }
fn default_min_sustain_secs() -> f64 { 4.0 }
fn default_max_peak_regions() -> usize { 6 }
fn default_max_stretch_deviation() -> f64 { 0.20 }
fn default_tolerance_bpm() -> f64 { 0.5 }
fn default_wsola_frame_secs() -> f64 { 0.03 }
fn default_bass_cutoff() -> f32 { 150.0 }
fn default_bass_swap_fraction() -> f32 { 0.125 }
fn default_min_loop_secs() -> f64 { 8.0 }
fn default_max_loop_bars() -> u32 { 64 }
fn default_min_loop_similarity() -> f32 { 0.8 }
fn default_seam_beats() -> u32 { 1 }
fn default_compare_beats() -> u32 { 4 }
fn default_target_rms_db() -> f32 { -14.0 }
fn default_max_target_secs() -> f64 { 86_400.0 }

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let unit = |name: &str, v: f32| -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };

        if !(self.beat.min_bpm > 0.0 && self.beat.min_bpm < self.beat.max_bpm) {
            return invalid(format!(
                "beat.min_bpm ({}) must be positive and below beat.max_bpm ({})",
                self.beat.min_bpm, self.beat.max_bpm
            ));
        }
        if self.beat.fallback_bpm <= 0.0 {
            return invalid("beat.fallback_bpm must be positive".into());
        }
        unit("beat.confidence_threshold", self.beat.confidence_threshold)?;
        unit("beat.octave_strength_ratio", self.beat.octave_strength_ratio)?;
        unit("key.confidence_threshold", self.key.confidence_threshold)?;
        if !(self.key.min_freq_hz > 0.0 && self.key.min_freq_hz < self.key.max_freq_hz) {
            return invalid("key.min_freq_hz must be positive and below key.max_freq_hz".into());
        }
        if self.energy.hop_secs <= 0.0 {
            return invalid("energy.hop_secs must be positive".into());
        }
        unit("structure.min_dynamic_range", self.structure.min_dynamic_range)?;
        unit("structure.intro_threshold", self.structure.intro_threshold)?;
        unit("structure.drop_threshold", self.structure.drop_threshold)?;
        unit("structure.outro_threshold", self.structure.outro_threshold)?;
        if self.tempo.frame_secs <= 0.0 || self.tempo.max_stretch_deviation <= 0.0 {
            return invalid("tempo.frame_secs and tempo.max_stretch_deviation must be positive".into());
        }
        if self.mix.transition_bars == 0 {
            return invalid("mix.transition_bars must be at least 1".into());
        }
        if let Some(bpm) = self.mix.target_bpm {
            if !(bpm.is_finite() && bpm > 0.0) {
                return invalid(format!("mix.target_bpm must be positive, got {bpm}"));
            }
        }
        unit("transition.bass_swap_fraction", self.transition.bass_swap_fraction)?;
        unit("transition.min_alignment_confidence", self.transition.min_alignment_confidence)?;
        unit("loop.min_similarity", self.looping.min_similarity)?;
        if self.looping.seam_beats == 0 || self.looping.compare_beats == 0 {
            return invalid("loop.seam_beats and loop.compare_beats must be at least 1".into());
        }
        if let Some(t) = self.job.timeout_secs {
            if t <= 0.0 {
                return invalid("job.timeout_secs must be positive".into());
            }
        }
        if !(self.job.max_target_secs.is_finite() && self.job.max_target_secs > 0.0) {
            return invalid("job.max_target_secs must be positive".into());
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.mix.transition_bars, 16);
        assert_eq!(config.mix.style, StyleName::Classic);
        assert!((config.beat.confidence_threshold - 0.35).abs() < 1e-6);
        assert!((config.tempo.max_stretch_deviation - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[mix]\ntransition_bars = 8\nstyle = \"bass_swap\"\nsync_beats = false\n\n[loop]\nmin_similarity = 0.7"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.mix.transition_bars, 8);
        assert_eq!(config.mix.style, StyleName::BassSwap);
        assert!(!config.mix.sync_beats);
        assert!(config.mix.match_tempo);
        assert!((config.looping.min_similarity - 0.7).abs() < 1e-6);
        assert_eq!(config.beat.min_bpm, 70.0);
    }

    #[test]
    fn test_rejects_inverted_bpm_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[beat]\nmin_bpm = 200.0\nmax_bpm = 100.0").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_energy_and_job_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[energy]\nhop_secs = 0.05\n\n[job]\nmax_target_secs = 7200.0").unwrap();
        let config = load_config(file.path()).unwrap();
        assert!((config.energy.hop_secs - 0.05).abs() < 1e-12);
        assert_eq!(config.job.max_target_secs, 7200.0);
        assert_eq!(config.job.timeout_secs, None);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[energy]\nhop_secs = 0.0").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[job]\nmax_target_secs = -1.0").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mix\ntransition_bars = ").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }
}

use thiserror::Error;

/// Failure kinds raised by the analysis and synthesis stages.
///
/// The recoverable kinds (`AmbiguousBeatGrid`, `ExcessiveTempoMismatch`, `LowConfidenceKey`
/// and `HarmonicClash`) are returned inside [`Diagnosed::warnings`] and the stage keeps going.
/// The rest abort the job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("ambiguous beat grid: confidence {confidence:.2} is below {threshold:.2}")]
    AmbiguousBeatGrid { confidence: f32, threshold: f32 },

    #[error(
        "tempo mismatch {source_bpm:.2} -> {target_bpm:.2} BPM (ratio {ratio:.3}) exceeds the stretch limit"
    )]
    ExcessiveTempoMismatch {
        source_bpm: f64,
        target_bpm: f64,
        ratio: f64,
    },

    #[error("low-confidence key estimate {camelot} (confidence {confidence:.2})")]
    LowConfidenceKey { camelot: String, confidence: f32 },

    #[error("harmonic clash between '{from}' ({from_key}) and '{to}' ({to_key})")]
    HarmonicClash {
        from: String,
        from_key: String,
        to: String,
        to_key: String,
    },

    #[error("no viable loop point: best similarity {best_similarity:.2}, need {threshold:.2}")]
    NoViableLoopPoint { best_similarity: f32, threshold: f32 },

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("job cancelled before {0}")]
    Cancelled(String),

    #[error("job exceeded its time limit of {0:.0}s")]
    TimedOut(f64),
}

impl AnalysisError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AnalysisError::AmbiguousBeatGrid { .. }
                | AnalysisError::ExcessiveTempoMismatch { .. }
                | AnalysisError::LowConfidenceKey { .. }
                | AnalysisError::HarmonicClash { .. }
        )
    }

    /// Stable identifier used in serialized reports.
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::AmbiguousBeatGrid { .. } => "ambiguous_beat_grid",
            AnalysisError::ExcessiveTempoMismatch { .. } => "excessive_tempo_mismatch",
            AnalysisError::LowConfidenceKey { .. } => "low_confidence_key",
            AnalysisError::HarmonicClash { .. } => "harmonic_clash",
            AnalysisError::NoViableLoopPoint { .. } => "no_viable_loop_point",
            AnalysisError::UnsupportedInput(_) => "unsupported_input",
            AnalysisError::InvalidParameter(_) => "invalid_parameter",
            AnalysisError::Cancelled(_) => "cancelled",
            AnalysisError::TimedOut(_) => "timed_out",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors raised while loading or validating a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// A stage result plus the non-fatal diagnostics collected while producing it.
#[derive(Debug, Clone)]
pub struct Diagnosed<T> {
    pub value: T,
    /// Recoverable error kinds (see [`AnalysisError::is_fatal`]).
    pub warnings: Vec<AnalysisError>,
    /// Informational remarks that do not indicate a problem with the input.
    pub notes: Vec<String>,
}

impl<T> Diagnosed<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn warn(&mut self, warning: AnalysisError) {
        debug_assert!(!warning.is_fatal(), "fatal error pushed as warning: {warning}");
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        log::info!("{note}");
        self.notes.push(note);
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Diagnosed<U> {
        Diagnosed {
            value: f(self.value),
            warnings: self.warnings,
            notes: self.notes,
        }
    }

    /// Moves this result's diagnostics into `sink` and returns the bare value.
    pub fn absorb_into<U>(self, sink: &mut Diagnosed<U>) -> T {
        sink.warnings.extend(self.warnings);
        sink.notes.extend(self.notes);
        self.value
    }
}

use clap::Parser;
use std::path::PathBuf;

use segue::config::Config;
use segue::mix::transition::StyleName;

#[derive(Parser, Debug)]
#[command(name = "segue", about = "Beat-synchronised DJ mixer and loop extender")]
pub struct Cli {
    /// Input audio files in play order (WAV, MP3, FLAC, OGG, AAC)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output audio file (format chosen from the extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Enable beat sync, tempo matching, harmonic checks and automatic transition points
    #[arg(long)]
    pub auto: bool,

    /// Align transitions to downbeats
    #[arg(long)]
    pub sync_beats: bool,

    /// Time-stretch every track to the target tempo
    #[arg(long)]
    pub match_tempo: bool,

    /// Warn about harmonically clashing transitions
    #[arg(long)]
    pub harmonic_mix: bool,

    /// Transition length in bars
    #[arg(long)]
    pub transition_bars: Option<u32>,

    /// Transition style
    #[arg(long, value_enum)]
    pub style: Option<StyleName>,

    /// Target tempo for the whole mix (defaults to the first track's tempo)
    #[arg(long)]
    pub target_bpm: Option<f64>,

    /// Analyse the inputs and print a report without rendering audio
    #[arg(long)]
    pub analyze_only: bool,

    /// With --analyze-only, fail on any analysis warning
    #[arg(long)]
    pub strict: bool,

    /// Extend a single input to this duration (e.g. 30m, 1h, 1h30m, 300s)
    #[arg(long)]
    pub extend: Option<String>,

    /// Write the diagnostics report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// FFmpeg audio codec (inferred from the output extension when omitted)
    #[arg(long)]
    pub codec: Option<String>,

    /// Audio bitrate for lossy codecs (e.g. 320k)
    #[arg(short, long)]
    pub bitrate: Option<String>,
}

impl Cli {
    /// Applies the flags that were given on top of the file configuration.
    pub fn apply_to(&self, config: &mut Config) {
        let mix = &mut config.mix;
        if self.auto {
            mix.sync_beats = true;
            mix.match_tempo = true;
            mix.harmonic_mix = true;
            mix.auto_detect_transition = true;
        }
        if self.sync_beats {
            mix.sync_beats = true;
        }
        if self.match_tempo {
            mix.match_tempo = true;
        }
        if self.harmonic_mix {
            mix.harmonic_mix = true;
        }
        if let Some(bars) = self.transition_bars {
            mix.transition_bars = bars;
        }
        if let Some(style) = self.style {
            mix.style = style;
        }
        if self.target_bpm.is_some() {
            mix.target_bpm = self.target_bpm;
        }
        if self.analyze_only {
            mix.analyze_only = true;
        }
        if self.strict {
            mix.strict = true;
        }
    }
}

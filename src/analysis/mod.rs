pub mod beat;
pub mod energy;
pub mod key;
pub mod structure;

use serde::Serialize;

use crate::audio::{dsp, WaveformBuffer};
use crate::config::Config;
use crate::error::{AnalysisError, Diagnosed, Result};

use beat::BeatGrid;
use energy::EnergyProfile;
use key::KeyEstimate;
use structure::StructureMarkers;

/// Everything the mixer needs to know about one track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackAnalysis {
    pub track_id: String,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub beat_grid: BeatGrid,
    pub key: KeyEstimate,
    pub energy: EnergyProfile,
    pub structure: StructureMarkers,
    #[serde(skip)]
    pub warnings: Vec<AnalysisError>,
    pub notes: Vec<String>,
}

/// Runs the per-track analysis graph: beat grid and key/energy in parallel, then structure
/// once both are available.
pub fn analyze_track(track_id: &str, buffer: &WaveformBuffer, config: &Config) -> Result<TrackAnalysis> {
    log::info!(
        "Analyzing '{}' ({:.1}s, {}Hz, {} ch)",
        track_id,
        buffer.duration_secs(),
        buffer.sample_rate(),
        buffer.channel_count()
    );

    let (beats, key_energy) = rayon::join(
        || beat::analyze_beats(buffer, &config.beat),
        || -> Result<(Diagnosed<KeyEstimate>, EnergyProfile)> {
            let signal = dsp::analysis_signal(buffer);
            let key = key::analyze_key(&signal, &config.key)?;
            let energy = energy::analyze_energy(buffer, config.energy.hop_secs)?;
            Ok((key, energy))
        },
    );
    let (key, energy) = key_energy?;

    let mut diagnostics = Diagnosed::clean(());
    let beat_grid = beats?.absorb_into(&mut diagnostics);
    let key = key.absorb_into(&mut diagnostics);
    let structure = structure::detect_structure(&energy, &beat_grid, buffer.duration_secs(), &config.structure)
        .absorb_into(&mut diagnostics);

    Ok(TrackAnalysis {
        track_id: track_id.to_string(),
        sample_rate: buffer.sample_rate(),
        duration_secs: buffer.duration_secs(),
        beat_grid,
        key,
        energy,
        structure,
        warnings: diagnostics.warnings,
        notes: diagnostics.notes,
    })
}

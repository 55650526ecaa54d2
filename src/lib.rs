//! Beat-synchronised DJ mixing and loop extension over decoded PCM.
//!
//! Tracks are analysed for tempo, beat grid, key, energy and structure; the
//! [`orchestrator::MixOrchestrator`] then plans transitions, time-stretches each track to a
//! common tempo and renders the overlaps, or extends a single track by looping it.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod mix;
pub mod orchestrator;
pub mod report;

#[cfg(test)]
mod test_signals;

pub use audio::WaveformBuffer;
pub use config::Config;
pub use error::{AnalysisError, Diagnosed};
pub use orchestrator::{CancellationToken, JobOutput, JobRequest, JobStage, MixOrchestrator, Track};

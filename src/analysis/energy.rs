use serde::Serialize;

use crate::audio::WaveformBuffer;
use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyPoint {
    pub time: f64,
    pub rms: f32,
}

/// Windowed RMS envelope sampled every `hop_secs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyProfile {
    pub hop_secs: f64,
    pub points: Vec<EnergyPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergySummary {
    /// Mean RMS relative to the loudest window.
    pub average: f32,
    /// Loudest window RMS (linear, full scale = 1.0).
    pub peak: f32,
}

impl EnergyProfile {
    pub fn values(&self) -> Vec<f32> {
        self.points.iter().map(|p| p.rms).collect()
    }

    pub fn peak(&self) -> f32 {
        self.points.iter().map(|p| p.rms).fold(0.0f32, f32::max)
    }

    pub fn summary(&self) -> EnergySummary {
        let peak = self.peak();
        if self.points.is_empty() || peak <= 0.0 {
            return EnergySummary { average: 0.0, peak };
        }
        let mean = self.points.iter().map(|p| p.rms).sum::<f32>() / self.points.len() as f32;
        EnergySummary { average: mean / peak, peak }
    }
}

pub fn analyze_energy(buffer: &WaveformBuffer, hop_secs: f64) -> Result<EnergyProfile> {
    if !(hop_secs > 0.0) {
        return Err(AnalysisError::InvalidParameter(format!("energy hop must be positive, got {hop_secs}")));
    }
    let mono = buffer.to_mono();
    let window = ((buffer.sample_rate() as f64 * hop_secs).round() as usize).max(1);

    let points = mono
        .chunks(window)
        .enumerate()
        .map(|(i, chunk)| EnergyPoint {
            time: i as f64 * window as f64 / buffer.sample_rate() as f64,
            rms: (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt(),
        })
        .collect();

    Ok(EnergyProfile { hop_secs: window as f64 / buffer.sample_rate() as f64, points })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_follows_ramp() {
        let sr = 8000;
        let samples: Vec<f32> = (0..sr * 5)
            .map(|i| {
                let t = i as f32 / sr as f32;
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                sign * t / 5.0
            })
            .collect();
        let buffer = WaveformBuffer::from_mono(sr as u32, samples).unwrap();
        let profile = analyze_energy(&buffer, 0.1).unwrap();

        assert_eq!(profile.points.len(), 50);
        assert!(profile.points.windows(2).all(|w| w[1].time > w[0].time));
        assert!(profile.points.windows(2).all(|w| w[1].rms >= w[0].rms));
        assert!(profile.points.iter().all(|p| p.rms >= 0.0));

        let summary = profile.summary();
        assert!(summary.peak > 0.95 && summary.peak <= 1.0);
        assert!((summary.average - 0.5).abs() < 0.05, "average {}", summary.average);
    }

    #[test]
    fn test_rejects_zero_hop() {
        let buffer = WaveformBuffer::from_mono(8000, vec![0.1; 800]).unwrap();
        assert!(analyze_energy(&buffer, 0.0).is_err());
    }
}

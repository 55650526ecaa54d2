//! Musical key estimation from a chroma profile and the Camelot wheel mapping.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::audio::dsp::{self, AnalysisSignal};
use crate::config::KeyConfig;
use crate::error::{AnalysisError, Diagnosed, Result};

const CHROMA_WINDOW_SECS: f64 = 0.37;

// Krumhansl-Kessler key profiles, index 0 = tonic.
const MAJOR_PROFILE: [f32; 12] = [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f32; 12] = [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];

// Camelot numbers indexed by tonic pitch class (C = 0).
const MAJOR_CAMELOT: [u8; 12] = [8, 3, 10, 5, 12, 7, 2, 9, 4, 11, 6, 1];
const MINOR_CAMELOT: [u8; 12] = [5, 12, 7, 2, 9, 4, 11, 6, 1, 8, 3, 10];

/// Relative margin between the two best key correlations that counts as fully decisive.
const DECISIVE_MARGIN: f32 = 0.2;

const PITCH_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CamelotLetter {
    /// Minor keys.
    A,
    /// Major keys.
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CamelotKey {
    pub number: u8,
    pub letter: CamelotLetter,
}

impl CamelotKey {
    pub fn new(number: u8, letter: CamelotLetter) -> Option<Self> {
        (1..=12).contains(&number).then_some(Self { number, letter })
    }

    pub fn from_pitch_class(pitch_class: u8, mode: Mode) -> Self {
        let pc = (pitch_class % 12) as usize;
        match mode {
            Mode::Major => Self { number: MAJOR_CAMELOT[pc], letter: CamelotLetter::B },
            Mode::Minor => Self { number: MINOR_CAMELOT[pc], letter: CamelotLetter::A },
        }
    }

    /// Tonic pitch class and mode for this wheel position.
    pub fn to_pitch_class(self) -> (u8, Mode) {
        let (table, mode) = match self.letter {
            CamelotLetter::B => (&MAJOR_CAMELOT, Mode::Major),
            CamelotLetter::A => (&MINOR_CAMELOT, Mode::Minor),
        };
        let pc = table.iter().position(|&n| n == self.number).unwrap_or(0);
        (pc as u8, mode)
    }

    /// Clockwise steps from `self` to `other` around the wheel, in `0..12`.
    pub fn steps_to(self, other: CamelotKey) -> u8 {
        ((other.number as i16 - self.number as i16).rem_euclid(12)) as u8
    }
}

impl fmt::Display for CamelotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self.letter {
            CamelotLetter::A => 'A',
            CamelotLetter::B => 'B',
        };
        write!(f, "{}{}", self.number, letter)
    }
}

impl FromStr for CamelotKey {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || AnalysisError::InvalidParameter(format!("'{s}' is not a Camelot key"));
        let mut chars = s.chars();
        let letter = match chars.next_back() {
            Some('A' | 'a') => CamelotLetter::A,
            Some('B' | 'b') => CamelotLetter::B,
            _ => return Err(invalid()),
        };
        let number: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        CamelotKey::new(number, letter).ok_or_else(invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KeyEstimate {
    pub pitch_class: u8,
    pub mode: Mode,
    pub confidence: f32,
}

impl KeyEstimate {
    pub fn camelot(&self) -> CamelotKey {
        CamelotKey::from_pitch_class(self.pitch_class, self.mode)
    }

    pub fn name(&self) -> String {
        let mode = match self.mode {
            Mode::Major => "major",
            Mode::Minor => "minor",
        };
        format!("{} {}", PITCH_NAMES[self.pitch_class as usize % 12], mode)
    }
}

/// Averaged, max-normalised 12-bin pitch-class energy.
pub fn chroma(signal: &AnalysisSignal, min_hz: f32, max_hz: f32) -> [f32; 12] {
    let fft_size = ((signal.rate * CHROMA_WINDOW_SECS).round() as usize).next_power_of_two();
    let frames = dsp::stft_magnitudes(&signal.samples, fft_size, fft_size / 2);
    let bin_hz = signal.rate as f32 / fft_size as f32;

    let bin_classes: Vec<Option<usize>> = (0..fft_size / 2)
        .map(|bin| {
            let freq = bin as f32 * bin_hz;
            if freq < min_hz || freq > max_hz {
                return None;
            }
            let midi = 69.0 + 12.0 * (freq / 440.0).log2();
            Some((midi.round() as i32).rem_euclid(12) as usize)
        })
        .collect();

    let mut chroma = [0.0f32; 12];
    for frame in &frames {
        for (mag, class) in frame.iter().zip(&bin_classes) {
            if let Some(pc) = class {
                chroma[*pc] += mag * mag;
            }
        }
    }
    let max = chroma.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        for c in &mut chroma {
            *c /= max;
        }
    }
    chroma
}

fn pearson(x: &[f32; 12], profile: &[f32; 12], rotation: usize) -> f32 {
    let mean_x = x.iter().sum::<f32>() / 12.0;
    let mean_p = profile.iter().sum::<f32>() / 12.0;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_p = 0.0;
    for pc in 0..12 {
        let dx = x[pc] - mean_x;
        let dp = profile[(pc + 12 - rotation) % 12] - mean_p;
        cov += dx * dp;
        var_x += dx * dx;
        var_p += dp * dp;
    }
    if var_x <= 1e-12 || var_p <= 1e-12 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_p.sqrt())
}

/// Correlates a chroma vector with all 24 rotated key profiles.
pub fn estimate_key_from_chroma(chroma: &[f32; 12]) -> KeyEstimate {
    let mut scores: Vec<(u8, Mode, f32)> = Vec::with_capacity(24);
    for tonic in 0..12u8 {
        scores.push((tonic, Mode::Major, pearson(chroma, &MAJOR_PROFILE, tonic as usize)));
        scores.push((tonic, Mode::Minor, pearson(chroma, &MINOR_PROFILE, tonic as usize)));
    }
    scores.sort_by(|a, b| b.2.total_cmp(&a.2));

    let (pitch_class, mode, best) = scores[0];
    let second = scores[1].2;
    let confidence = if best > 0.0 {
        let margin = ((best - second) / best / DECISIVE_MARGIN).clamp(0.0, 1.0);
        best.clamp(0.0, 1.0) * margin
    } else {
        0.0
    };
    KeyEstimate { pitch_class, mode, confidence }
}

pub fn analyze_key(signal: &AnalysisSignal, config: &KeyConfig) -> Result<Diagnosed<KeyEstimate>> {
    if signal.samples.is_empty() {
        return Err(AnalysisError::UnsupportedInput("no samples to analyse".into()));
    }
    let profile = chroma(signal, config.min_freq_hz, config.max_freq_hz);
    let key = estimate_key_from_chroma(&profile);

    log::info!(
        "Key: {} ({}), confidence {:.2}",
        key.name(),
        key.camelot(),
        key.confidence
    );

    let mut result = Diagnosed::clean(key);
    if key.confidence < config.confidence_threshold {
        result.warn(AnalysisError::LowConfidenceKey {
            camelot: key.camelot().to_string(),
            confidence: key.confidence,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::dsp::analysis_signal;
    use crate::test_signals::{silence, tones, A_MINOR_TRIAD, C_MAJOR_TRIAD};

    #[test]
    fn test_camelot_reference_positions() {
        let cases = [
            (0, Mode::Major, "8B"),
            (9, Mode::Minor, "8A"),
            (7, Mode::Major, "9B"),
            (4, Mode::Minor, "9A"),
            (2, Mode::Major, "10B"),
            (5, Mode::Major, "7B"),
            (11, Mode::Major, "1B"),
            (8, Mode::Minor, "1A"),
        ];
        for (pc, mode, expected) in cases {
            assert_eq!(CamelotKey::from_pitch_class(pc, mode).to_string(), expected);
        }
    }

    #[test]
    fn test_camelot_table_is_a_bijection() {
        for pc in 0..12u8 {
            for mode in [Mode::Major, Mode::Minor] {
                let key = CamelotKey::from_pitch_class(pc, mode);
                assert_eq!(key.to_pitch_class(), (pc, mode));
            }
        }
    }

    #[test]
    fn test_parse_camelot() {
        assert_eq!("8A".parse::<CamelotKey>().unwrap(), CamelotKey::new(8, CamelotLetter::A).unwrap());
        assert_eq!(" 12b ".parse::<CamelotKey>().unwrap().to_string(), "12B");
        assert!("13A".parse::<CamelotKey>().is_err());
        assert!("8C".parse::<CamelotKey>().is_err());
        assert!("".parse::<CamelotKey>().is_err());
        assert!("8é".parse::<CamelotKey>().is_err());
        assert!("éA".parse::<CamelotKey>().is_err());
    }

    #[test]
    fn test_a_minor_triad_maps_to_8a() {
        let signal = analysis_signal(&tones(44100, 8.0, &A_MINOR_TRIAD, 0.2));
        let result = analyze_key(&signal, &KeyConfig::default()).unwrap();
        assert_eq!(result.value.camelot().to_string(), "8A", "got {}", result.value.name());
        assert!(result.warnings.is_empty(), "confidence {}", result.value.confidence);
    }

    #[test]
    fn test_c_major_triad_maps_to_8b() {
        let signal = analysis_signal(&tones(44100, 8.0, &C_MAJOR_TRIAD, 0.2));
        let key = analyze_key(&signal, &KeyConfig::default()).unwrap().value;
        assert_eq!(key.pitch_class, 0);
        assert_eq!(key.mode, Mode::Major);
    }

    #[test]
    fn test_silence_is_low_confidence() {
        let signal = analysis_signal(&silence(22050, 4.0));
        let result = analyze_key(&signal, &KeyConfig::default()).unwrap();
        assert_eq!(result.value.confidence, 0.0);
        assert!(matches!(
            result.warnings.as_slice(),
            [AnalysisError::LowConfidenceKey { .. }]
        ));
    }
}

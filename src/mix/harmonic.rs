use serde::Serialize;

use crate::analysis::key::{CamelotKey, KeyEstimate};

/// How well two keys blend according to the Camelot wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    /// Identical Camelot code.
    PerfectMatch,
    /// One step around the wheel in the same mode.
    EnergyShift,
    /// Relative major/minor: same number, other letter.
    MoodShift,
    Clash,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarmonicVerdict {
    pub from: String,
    pub to: String,
    pub compatibility: Compatibility,
    /// False when either key estimate was below the confidence threshold.
    pub reliable: bool,
}

impl HarmonicVerdict {
    /// A clash that should be reported to the user.
    pub fn is_reportable_clash(&self) -> bool {
        self.reliable && self.compatibility == Compatibility::Clash
    }
}

pub fn classify(a: CamelotKey, b: CamelotKey) -> Compatibility {
    let steps = a.steps_to(b);
    match (steps, a.letter == b.letter) {
        (0, true) => Compatibility::PerfectMatch,
        (0, false) => Compatibility::MoodShift,
        (1 | 11, true) => Compatibility::EnergyShift,
        _ => Compatibility::Clash,
    }
}

pub fn check(a: &KeyEstimate, b: &KeyEstimate, min_confidence: f32) -> HarmonicVerdict {
    let (ka, kb) = (a.camelot(), b.camelot());
    let compatibility = classify(ka, kb);
    let reliable = a.confidence >= min_confidence && b.confidence >= min_confidence;
    log::debug!("Harmonic check {} -> {}: {:?} (reliable: {})", ka, kb, compatibility, reliable);
    HarmonicVerdict {
        from: ka.to_string(),
        to: kb.to_string(),
        compatibility,
        reliable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::key::{CamelotLetter, Mode};

    fn key(s: &str) -> CamelotKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_reference_classifications() {
        assert_eq!(classify(key("8A"), key("8A")), Compatibility::PerfectMatch);
        assert_eq!(classify(key("8A"), key("9A")), Compatibility::EnergyShift);
        assert_eq!(classify(key("12B"), key("1B")), Compatibility::EnergyShift);
        assert_eq!(classify(key("8A"), key("8B")), Compatibility::MoodShift);
        assert_eq!(classify(key("8A"), key("9B")), Compatibility::Clash);
        assert_eq!(classify(key("8A"), key("3B")), Compatibility::Clash);
        assert_eq!(classify(key("8A"), key("10A")), Compatibility::Clash);
    }

    #[test]
    fn test_classification_is_symmetric() {
        for na in 1..=12 {
            for nb in 1..=12 {
                for la in [CamelotLetter::A, CamelotLetter::B] {
                    for lb in [CamelotLetter::A, CamelotLetter::B] {
                        let a = CamelotKey::new(na, la).unwrap();
                        let b = CamelotKey::new(nb, lb).unwrap();
                        assert_eq!(classify(a, b), classify(b, a), "{a} vs {b}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_low_confidence_clash_is_not_reported() {
        let a = KeyEstimate { pitch_class: 9, mode: Mode::Minor, confidence: 0.9 };
        let b = KeyEstimate { pitch_class: 1, mode: Mode::Major, confidence: 0.1 };
        let verdict = check(&a, &b, 0.3);
        assert_eq!(verdict.compatibility, Compatibility::Clash);
        assert!(!verdict.is_reportable_clash());

        let b = KeyEstimate { confidence: 0.8, ..b };
        assert!(check(&a, &b, 0.3).is_reportable_clash());
    }
}

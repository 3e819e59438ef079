//! # Test lifecycle steps.
//!
//! The embedded controller reports progress as an integer 1–9 on `benchX/step`.
//!
//! ```text
//!  1 internal resistance ─► 2 charge ─► 3 discharge ─► 4 final charge ─► 5 completed
//!                                                                         (releases bench)
//!  6 failed │ 7 safety stop │ 8 emergency stop   → persisted, test keeps running
//!  9 manual stop                                 → test ends, bench stays occupied
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Lifecycle step of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Step {
    #[default]
    InternalResistance,
    Charge,
    Discharge,
    FinalCharge,
    Completed,
    Failed,
    SafetyStop,
    EmergencyStop,
    ManualStop,
}

impl Step {
    /// Wire code (1–9).
    pub fn code(self) -> u8 {
        match self {
            Step::InternalResistance => 1,
            Step::Charge => 2,
            Step::Discharge => 3,
            Step::FinalCharge => 4,
            Step::Completed => 5,
            Step::Failed => 6,
            Step::SafetyStop => 7,
            Step::EmergencyStop => 8,
            Step::ManualStop => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Step::InternalResistance,
            2 => Step::Charge,
            3 => Step::Discharge,
            4 => Step::FinalCharge,
            5 => Step::Completed,
            6 => Step::Failed,
            7 => Step::SafetyStop,
            8 => Step::EmergencyStop,
            9 => Step::ManualStop,
            _ => return None,
        })
    }

    /// Parses a `benchX/step` payload (decimal integer, surrounding whitespace allowed).
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        payload
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(Step::from_code)
            .ok_or_else(|| ParseError::Step {
                payload: payload.to_string(),
            })
    }

    /// Measurement mode attributed to rows written while this step is current.
    pub fn mode(self) -> Mode {
        match self {
            Step::InternalResistance => Mode::PhaseRi,
            Step::Charge => Mode::Charge,
            Step::Discharge => Mode::Discharge,
            Step::FinalCharge => Mode::FinalCharge,
            _ => Mode::Unknown,
        }
    }

    /// Only the completed step hands the bench back to the pool.
    pub fn releases_bench(self) -> bool {
        matches!(self, Step::Completed)
    }

    /// Steps after which the test task exits.
    pub fn ends_test(self) -> bool {
        matches!(self, Step::Completed | Step::ManualStop)
    }

    /// Summary fields (capacity/energy) are frozen once the test is finishing or halted.
    pub fn freezes_summary(self) -> bool {
        matches!(self, Step::Completed | Step::ManualStop)
    }
}

impl From<Step> for u8 {
    fn from(step: Step) -> u8 {
        step.code()
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Step::from_code(code).ok_or_else(|| format!("step out of range: {code}"))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Phase label written into each measurement row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    PhaseRi,
    Charge,
    Discharge,
    FinalCharge,
    Unknown,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::PhaseRi => "phase_ri",
            Mode::Charge => "charge",
            Mode::Discharge => "discharge",
            Mode::FinalCharge => "final_charge",
            Mode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_all_codes() {
        for code in 1..=9u8 {
            let step = Step::parse(&code.to_string()).unwrap();
            assert_eq!(step.code(), code);
        }
        assert_eq!(Step::parse(" 3\n").unwrap(), Step::Discharge);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(Step::parse("0").is_err());
        assert!(Step::parse("10").is_err());
        assert!(Step::parse("two").is_err());
        assert!(Step::parse("").is_err());
        assert!(Step::parse("-1").is_err());
    }

    #[test]
    fn test_release_asymmetry() {
        assert!(Step::Completed.releases_bench());
        assert!(!Step::ManualStop.releases_bench());
        assert!(Step::Completed.ends_test());
        assert!(Step::ManualStop.ends_test());
        for step in [Step::Failed, Step::SafetyStop, Step::EmergencyStop] {
            assert!(!step.ends_test());
            assert!(!step.releases_bench());
        }
    }

    #[test]
    fn test_mode_mapping() {
        assert_eq!(Step::InternalResistance.mode().as_str(), "phase_ri");
        assert_eq!(Step::Charge.mode().as_str(), "charge");
        assert_eq!(Step::Discharge.mode().as_str(), "discharge");
        assert_eq!(Step::FinalCharge.mode().as_str(), "final_charge");
        assert_eq!(Step::Completed.mode(), Mode::Unknown);
        assert_eq!(Step::SafetyStop.mode(), Mode::Unknown);
    }

    #[test]
    fn test_serde_as_integer() {
        let json = serde_json::to_string(&Step::FinalCharge).unwrap();
        assert_eq!(json, "4");
        let back: Step = serde_json::from_str("9").unwrap();
        assert_eq!(back, Step::ManualStop);
        assert!(serde_json::from_str::<Step>("12").is_err());
    }
}

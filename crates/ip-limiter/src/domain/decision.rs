//! Admission decisions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating a (credential, address) pair against the limits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Within both limits
    Allowed,
    /// Limiter disabled, not ready, or the store failed; allowed without tracking
    FailOpen,
    /// A new distinct address would exceed the per-credential fan-out
    AddressLimit { active: u64, max: u32 },
    /// The address already holds the maximum number of connections
    ConnectionLimit { count: i64, max: u32 },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed | AdmissionDecision::FailOpen)
    }

    pub fn is_rejected(&self) -> bool {
        !self.is_allowed()
    }
}

/// A decision together with what it did to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub decision: AdmissionDecision,
    /// The connection was counted and needs a release on teardown
    pub recorded: bool,
}

impl AdmissionOutcome {
    pub fn untracked(decision: AdmissionDecision) -> Self {
        Self {
            decision,
            recorded: false,
        }
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDecision::Allowed => write!(f, "allowed"),
            AdmissionDecision::FailOpen => write!(f, "allowed (fail-open)"),
            AdmissionDecision::AddressLimit { active, max } => {
                write!(f, "address limit reached ({active}/{max})")
            }
            AdmissionDecision::ConnectionLimit { count, max } => {
                write!(f, "connection limit reached ({count}/{max})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_open_is_allowed() {
        assert!(AdmissionDecision::FailOpen.is_allowed());
        assert!(AdmissionDecision::Allowed.is_allowed());
        assert!(AdmissionDecision::AddressLimit { active: 2, max: 2 }.is_rejected());
        assert!(AdmissionDecision::ConnectionLimit { count: 1, max: 1 }.is_rejected());
    }

    #[test]
    fn test_display() {
        let d = AdmissionDecision::AddressLimit { active: 3, max: 2 };
        assert_eq!(d.to_string(), "address limit reached (3/2)");
    }
}

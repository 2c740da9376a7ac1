//! Type definitions for the validation predicate.

use serde::{Deserialize, Serialize};

/// Which side of the conversation is being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardMode {
    Input,
    Output,
}

/// How thorough a single validation call should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Every configured check.
    Full,
    /// Cheap checks only; used for forced chunks that are not whole sentences.
    Light,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy::Full
    }
}

/// Verdict of the validation predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(String),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

/// A validated chunk, still tagged with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub sequence: u64,
    pub text: String,
    pub outcome: ValidationOutcome,
}

/// Strictness of the built-in keyword guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailLevel {
    None,
    Moderate,
    Strict,
}

impl Default for GuardrailLevel {
    fn default() -> Self {
        GuardrailLevel::Moderate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_mode_serialization() {
        assert_eq!(serde_json::to_string(&GuardMode::Input).unwrap(), "\"input\"");
        assert_eq!(serde_json::to_string(&GuardMode::Output).unwrap(), "\"output\"");
    }

    #[test]
    fn test_policy_serialization() {
        assert_eq!(
            serde_json::to_string(&ValidationPolicy::Light).unwrap(),
            "\"light\""
        );
        assert_eq!(ValidationPolicy::default(), ValidationPolicy::Full);
    }

    #[test]
    fn test_guardrail_level_parse() {
        let level: GuardrailLevel = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(level, GuardrailLevel::Strict);
        assert_eq!(GuardrailLevel::default(), GuardrailLevel::Moderate);
    }

    #[test]
    fn test_outcome_is_valid() {
        assert!(ValidationOutcome::Valid.is_valid());
        assert!(!ValidationOutcome::Invalid("pii".into()).is_valid());
    }
}

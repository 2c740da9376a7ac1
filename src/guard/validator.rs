//! The validation predicate seam and the built-in keyword guard.

use regex::Regex;

use crate::error::GuardStreamError;
use crate::guard::types::{GuardMode, GuardrailLevel, ValidationOutcome, ValidationPolicy};

/// Blocking content-safety predicate.
///
/// Implementations may be slow and are always invoked from a blocking worker
/// thread, possibly from several workers at once.
pub trait Validator: Send + Sync {
    fn validate(
        &self,
        text: &str,
        mode: GuardMode,
        policy: ValidationPolicy,
    ) -> Result<ValidationOutcome, GuardStreamError>;
}

impl<F> Validator for F
where
    F: Fn(&str, GuardMode, ValidationPolicy) -> Result<ValidationOutcome, GuardStreamError>
        + Send
        + Sync,
{
    fn validate(
        &self,
        text: &str,
        mode: GuardMode,
        policy: ValidationPolicy,
    ) -> Result<ValidationOutcome, GuardStreamError> {
        self(text, mode, policy)
    }
}

const STRICT_TERMS: &[&str] = &["hate", "violence", "illegal"];
const MODERATE_TERMS: &[&str] = &["spam"];

/// Keyword blocklist with optional PII detection.
///
/// PII patterns only run under [`ValidationPolicy::Full`].
#[derive(Debug, Clone)]
pub struct KeywordGuard {
    level: GuardrailLevel,
    extra_terms: Vec<String>,
    pii: Option<PiiPatterns>,
}

#[derive(Debug, Clone)]
struct PiiPatterns {
    email: Regex,
    phone: Regex,
}

impl PiiPatterns {
    fn new() -> Result<Self, GuardStreamError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| GuardStreamError::ConfigError(e.to_string()))
        };
        Ok(Self {
            email: compile(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b")?,
            phone: compile(r"(?:\+?\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b")?,
        })
    }

    fn find(&self, text: &str) -> Option<&'static str> {
        if self.email.is_match(text) {
            Some("EMAIL_ADDRESS")
        } else if self.phone.is_match(text) {
            Some("PHONE_NUMBER")
        } else {
            None
        }
    }
}

impl KeywordGuard {
    pub fn new(level: GuardrailLevel) -> Self {
        Self {
            level,
            extra_terms: Vec::new(),
            pii: None,
        }
    }

    /// Also block these terms, whatever the level.
    pub fn block_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_terms
            .extend(terms.into_iter().map(|t| t.into().to_lowercase()));
        self
    }

    /// Enable email and phone number detection for full-policy checks.
    pub fn detect_pii(mut self) -> Result<Self, GuardStreamError> {
        self.pii = Some(PiiPatterns::new()?);
        Ok(self)
    }

    pub fn level(&self) -> GuardrailLevel {
        self.level
    }

    fn level_terms(&self) -> &'static [&'static str] {
        match self.level {
            GuardrailLevel::None => &[],
            GuardrailLevel::Moderate => MODERATE_TERMS,
            GuardrailLevel::Strict => STRICT_TERMS,
        }
    }
}

impl Validator for KeywordGuard {
    fn validate(
        &self,
        text: &str,
        mode: GuardMode,
        policy: ValidationPolicy,
    ) -> Result<ValidationOutcome, GuardStreamError> {
        let lowered = text.to_lowercase();

        let hit = self
            .level_terms()
            .iter()
            .copied()
            .chain(self.extra_terms.iter().map(String::as_str))
            .find(|term| lowered.contains(term));
        if let Some(term) = hit {
            return Ok(ValidationOutcome::Invalid(format!(
                "{:?} guard matched blocked term '{}'",
                mode, term
            )));
        }

        if policy == ValidationPolicy::Full {
            if let Some(entity) = self.pii.as_ref().and_then(|p| p.find(text)) {
                return Ok(ValidationOutcome::Invalid(format!(
                    "{:?} guard detected {}",
                    mode, entity
                )));
            }
        }

        Ok(ValidationOutcome::Valid)
    }
}

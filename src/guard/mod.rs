//! Content-safety predicate used by the pipeline.
//!
//! The pipeline only sees the [`Validator`] trait: a blocking, possibly slow
//! check that answers `Valid` or `Invalid(reason)`. Two implementations ship
//! with the crate: [`KeywordGuard`], a local blocklist with optional PII
//! detection, and [`RemoteGuard`], which asks an HTTP guard service.
//!
//! # Example
//!
//! ```rust
//! use guardstream::guard::{
//!     GuardMode, GuardrailLevel, KeywordGuard, ValidationOutcome, ValidationPolicy, Validator,
//! };
//!
//! let guard = KeywordGuard::new(GuardrailLevel::Strict);
//! let outcome = guard
//!     .validate("No violence, please.", GuardMode::Output, ValidationPolicy::Full)
//!     .unwrap();
//! assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
//! ```

mod client;
mod types;
mod validator;

pub use client::{RemoteGuard, RemoteGuardConfig};
pub use types::{GuardMode, GuardrailLevel, ValidationOutcome, ValidationPolicy, ValidationResult};
pub use validator::{KeywordGuard, Validator};

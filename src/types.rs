use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::GuardStreamError;

/// Caller-facing message when an output chunk fails validation.
pub const BLOCKED_MESSAGE: &str = "Response blocked by output guardrails";
/// Caller-facing message when the generation backend fails.
pub const BACKEND_FAILED_MESSAGE: &str = "Generation backend failed";
/// Caller-facing message for any internal pipeline fault.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error";
/// Caller-facing message for an empty prompt.
pub const PROMPT_REQUIRED_MESSAGE: &str = "Prompt is required";
/// Caller-facing message when the requested model has no route.
pub const UNKNOWN_MODEL_MESSAGE: &str = "Unknown model";
/// Caller-facing message when the prompt fails the input guard.
pub const INPUT_BLOCKED_MESSAGE: &str = "Prompt blocked by input guardrails";

/// Inbound request from the presentation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// Outbound message to the presentation layer.
///
/// Serializes to exactly one of `{"token": "..."}`, `{"token": null}` or
/// `{"error": "..."}`. The last two are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Error { error: String },
    Token { token: Option<String> },
}

impl ClientMessage {
    pub fn token(text: impl Into<String>) -> Self {
        ClientMessage::Token {
            token: Some(text.into()),
        }
    }

    pub fn end() -> Self {
        ClientMessage::Token { token: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientMessage::Error {
            error: message.into(),
        }
    }

    /// Whether this message closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientMessage::Error { .. } | ClientMessage::Token { token: None }
        )
    }
}

/// Why the token feed ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The backend sent its end marker.
    Completed,
    /// The backend reported an error or the connection dropped.
    BackendFailed,
    /// An upstream stage went away without sending an end marker.
    Interrupted,
}

/// One element of the producer's feed into the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    End(EndReason),
}

/// How a chunk came to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Ended on a sentence boundary.
    Complete,
    /// Flushed by the size cap, the wait cap, or end of stream.
    Forced,
}

/// A span of generated text handed to the validator as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub sequence: u64,
    pub text: String,
    pub completeness: Completeness,
    pub received_at: DateTime<Utc>,
}

/// Terminal state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Blocked { sequence: u64 },
    BackendFailed,
    Internal,
    Disconnected,
}

/// What a finished connection reports back to its caller.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub connection_id: Uuid,
    pub outcome: StreamOutcome,
    pub chunks_emitted: u64,
}

/// Tuning for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_chunk_chars: usize,
    pub max_wait_ms: u64,
    pub flush_check_interval_ms: u64,
    /// Concurrent validations allowed for a single connection.
    pub max_in_flight: usize,
    /// Size of the worker pool shared by every connection.
    pub global_workers: usize,
    pub chunk_queue_capacity: usize,
    pub token_queue_capacity: usize,
    pub outbound_capacity: usize,
    pub writer_timeout_ms: u64,
    /// Validate forced chunks with the light policy.
    pub light_forced_checks: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            max_chunk_chars: 200,
            max_wait_ms: 2000,
            flush_check_interval_ms: 100,
            max_in_flight: 3,
            global_workers: 8,
            chunk_queue_capacity: 4,
            token_queue_capacity: 64,
            outbound_capacity: 64,
            writer_timeout_ms: 5000,
            light_forced_checks: true,
        }
    }

    pub fn max_chunk_chars(mut self, chars: usize) -> Self {
        self.max_chunk_chars = chars;
        self
    }

    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn flush_check_interval_ms(mut self, ms: u64) -> Self {
        self.flush_check_interval_ms = ms;
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn global_workers(mut self, n: usize) -> Self {
        self.global_workers = n;
        self
    }

    pub fn chunk_queue_capacity(mut self, capacity: usize) -> Self {
        self.chunk_queue_capacity = capacity;
        self
    }

    pub fn token_queue_capacity(mut self, capacity: usize) -> Self {
        self.token_queue_capacity = capacity;
        self
    }

    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn writer_timeout_ms(mut self, ms: u64) -> Self {
        self.writer_timeout_ms = ms;
        self
    }

    pub fn light_forced_checks(mut self, enable: bool) -> Self {
        self.light_forced_checks = enable;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    pub fn writer_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_timeout_ms)
    }

    /// Reject settings that would stall or deadlock a pipeline.
    pub fn validate(&self) -> Result<(), GuardStreamError> {
        let limits = [
            ("max_chunk_chars", self.max_chunk_chars),
            ("max_in_flight", self.max_in_flight),
            ("global_workers", self.global_workers),
            ("chunk_queue_capacity", self.chunk_queue_capacity),
            ("token_queue_capacity", self.token_queue_capacity),
            ("outbound_capacity", self.outbound_capacity),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(GuardStreamError::ConfigError(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.flush_check_interval_ms == 0 {
            return Err(GuardStreamError::ConfigError(
                "flush_check_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

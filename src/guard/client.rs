//! Client for an external HTTP guard service.

use crate::error::GuardStreamError;
use crate::guard::types::{GuardMode, ValidationOutcome, ValidationPolicy};
use crate::guard::validator::Validator;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Handle;

/// Configuration for [`RemoteGuard`].
#[derive(Debug, Clone)]
pub struct RemoteGuardConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl RemoteGuardConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: 30,
        }
    }

    /// Send this key as a bearer token.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout_secs(mut self, timeout: u64) -> Self {
        self.timeout_secs = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    text: &'a str,
    on: GuardMode,
    policy: ValidationPolicy,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Validator backed by a remote guard service.
///
/// The call is made with the async client on the ambient tokio runtime, so
/// `validate` must run on a runtime blocking thread (as the dispatcher does).
pub struct RemoteGuard {
    config: RemoteGuardConfig,
    http_client: Client,
}

impl RemoteGuard {
    pub fn new(config: RemoteGuardConfig) -> Result<Self, GuardStreamError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/validate", self.config.base_url.trim_end_matches('/'))
    }

    async fn validate_async(
        &self,
        text: &str,
        mode: GuardMode,
        policy: ValidationPolicy,
    ) -> Result<ValidationOutcome, GuardStreamError> {
        let request = ValidateRequest {
            text,
            on: mode,
            policy,
        };

        let mut builder = self
            .http_client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GuardStreamError::ApiError {
                status_code: status.as_u16(),
                message,
            });
        }

        let data: ValidateResponse = response.json().await?;
        if data.valid {
            Ok(ValidationOutcome::Valid)
        } else {
            Ok(ValidationOutcome::Invalid(
                data.reason.unwrap_or_else(|| "rejected by guard service".to_string()),
            ))
        }
    }
}

impl Validator for RemoteGuard {
    fn validate(
        &self,
        text: &str,
        mode: GuardMode,
        policy: ValidationPolicy,
    ) -> Result<ValidationOutcome, GuardStreamError> {
        let handle = Handle::try_current().map_err(|e| {
            GuardStreamError::ConfigError(format!("remote guard needs a tokio runtime: {}", e))
        })?;
        handle.block_on(self.validate_async(text, mode, policy))
    }
}

//! Generation backends: the external token source feeding the pipeline.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::GuardStreamError;

pub mod framing;
mod http;
pub mod router;

pub use framing::Framing;
pub use http::HttpBackend;
pub use router::{ModelRoute, ModelRouter, PayloadTemplate, RoutedRequest};

/// One decoded message from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Token(String),
    Done,
    Error(String),
}

/// Stream of backend messages for one generation request.
pub type BackendStream = BoxStream<'static, Result<BackendEvent, GuardStreamError>>;

/// Something that can start a streamed generation.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Send the initial request and return the message stream.
    async fn open(&self, prompt: &str) -> Result<BackendStream, GuardStreamError>;
}

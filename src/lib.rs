//! Guarded token streaming for LLM backends.
//!
//! Tokens from a generation backend are grouped into sentence-sized chunks,
//! checked by a content-safety [`Validator`](guard::Validator) on a bounded
//! worker pool, and delivered to the caller strictly in generation order. The
//! first chunk that fails the check ends the stream with a single error.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use guardstream::{GenerateRequest, GuardedStream, ModelRouter, PipelineConfig};
//! use guardstream::guard::{GuardrailLevel, KeywordGuard};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let guard = KeywordGuard::new(GuardrailLevel::Strict).detect_pii()?;
//!     let pipeline = GuardedStream::new(PipelineConfig::new(), Arc::new(guard))?;
//!     let router = ModelRouter::new("http://localhost:8765");
//!
//!     let (tx, mut rx) = mpsc::channel(64);
//!     let request = GenerateRequest::new("Tell me a story").model("llama-3.2");
//!     let serving = tokio::spawn(async move { pipeline.handle(request, &router, tx).await });
//!
//!     while let Some(message) = rx.recv().await {
//!         println!("{}", serde_json::to_string(&message)?);
//!     }
//!
//!     let summary = serving.await??;
//!     println!("{:?} after {} chunks", summary.outcome, summary.chunks_emitted);
//!     Ok(())
//! }
//! ```
//!
//! # Remote Guard Service
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use guardstream::{GuardedStream, ModelRouter, PipelineConfig, WorkerPool};
//! use guardstream::backend::HttpBackend;
//! use guardstream::guard::{RemoteGuard, RemoteGuardConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let guard = RemoteGuard::new(
//!         RemoteGuardConfig::new("http://localhost:9000").api_key("gs_live_key"),
//!     )?;
//!
//!     // One pool for every connection in the process.
//!     let pool = WorkerPool::new(8);
//!     let pipeline = GuardedStream::with_pool(PipelineConfig::new(), Arc::new(guard), pool)?;
//!
//!     let routed = ModelRouter::new("http://localhost:8765")
//!         .resolve(&guardstream::GenerateRequest::new("Hi").model("gpt-4"))?;
//!     let backend = HttpBackend::new(routed.route)?;
//!
//!     let mut messages = pipeline.stream(routed.prompt, backend);
//!     while let Some(message) = messages.next().await {
//!         println!("{:?}", message);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod types;
pub mod backend;
pub mod guard;
pub mod pipeline;

pub use backend::{BackendEvent, HttpBackend, ModelRouter, TokenSource};
pub use error::GuardStreamError;
pub use pipeline::{GuardedStream, WorkerPool};
pub use types::*;

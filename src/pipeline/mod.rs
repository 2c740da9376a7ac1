//! The guarded streaming pipeline.
//!
//! Each connection runs four stages joined by bounded channels:
//!
//! ```text
//! producer -> assembler -> dispatcher -> writer -> sink
//! ```
//!
//! The producer pulls tokens from a [`TokenSource`], the [`Assembler`] groups
//! them into numbered chunks, the [`Dispatcher`] validates chunks
//! concurrently on a shared [`WorkerPool`], and the [`OrderedWriter`] emits
//! passing chunks in sequence order. The first failing chunk ends the stream
//! with a single error and a cancelled connection.

pub mod assembler;
pub mod dispatcher;
pub mod producer;
pub mod writer;

pub use assembler::{Assembler, AssemblerOutput, BoundaryDetector, PunctuationBoundary};
pub use dispatcher::{Dispatcher, WorkerPool};
pub use producer::produce;
pub use writer::{InFlight, OrderedWriter, WriterInput, WriterReport, WriterState};

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{HttpBackend, ModelRouter, TokenSource};
use crate::error::GuardStreamError;
use crate::guard::{GuardMode, ValidationOutcome, ValidationPolicy, Validator};
use crate::types::{
    ClientMessage, GenerateRequest, PipelineConfig, StreamOutcome, StreamSummary,
    INPUT_BLOCKED_MESSAGE, INTERNAL_ERROR_MESSAGE, PROMPT_REQUIRED_MESSAGE,
    UNKNOWN_MODEL_MESSAGE,
};

/// Runs guarded connections.
///
/// Cheap to clone; clones share the validator and the worker pool.
#[derive(Clone)]
pub struct GuardedStream {
    config: PipelineConfig,
    validator: Arc<dyn Validator>,
    pool: WorkerPool,
}

impl GuardedStream {
    /// Create a pipeline with its own worker pool of `config.global_workers`.
    pub fn new(
        config: PipelineConfig,
        validator: Arc<dyn Validator>,
    ) -> Result<Self, GuardStreamError> {
        let pool = WorkerPool::new(config.global_workers);
        Self::with_pool(config, validator, pool)
    }

    /// Create a pipeline that shares an existing worker pool.
    pub fn with_pool(
        config: PipelineConfig,
        validator: Arc<dyn Validator>,
        pool: WorkerPool,
    ) -> Result<Self, GuardStreamError> {
        config.validate()?;
        Ok(Self {
            config,
            validator,
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run the input-side check on a prompt, on the shared worker pool.
    pub async fn check_input(&self, prompt: &str) -> Result<ValidationOutcome, GuardStreamError> {
        let worker = self
            .pool
            .acquire()
            .await
            .ok_or_else(|| GuardStreamError::Internal("worker pool closed".to_string()))?;

        let validator = self.validator.clone();
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let _worker = worker;
            validator.validate(&prompt, GuardMode::Input, ValidationPolicy::Full)
        })
        .await
        .map_err(|e| GuardStreamError::Internal(e.to_string()))?
    }

    /// Serve one connection to completion.
    ///
    /// Every message for the caller goes to `sink`, ending with exactly one
    /// terminal message. Requests rejected before generation starts get their
    /// error message and an `Err`; everything after that is reported through
    /// the returned summary.
    pub async fn serve<S>(
        &self,
        prompt: &str,
        source: &S,
        sink: mpsc::Sender<ClientMessage>,
    ) -> Result<StreamSummary, GuardStreamError>
    where
        S: TokenSource + ?Sized,
    {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return reject(
                &sink,
                PROMPT_REQUIRED_MESSAGE,
                GuardStreamError::InvalidRequest(PROMPT_REQUIRED_MESSAGE.to_string()),
            )
            .await;
        }

        match self.check_input(prompt).await {
            Ok(ValidationOutcome::Valid) => {}
            Ok(ValidationOutcome::Invalid(reason)) => {
                warn!(%reason, "prompt failed input validation");
                return reject(
                    &sink,
                    INPUT_BLOCKED_MESSAGE,
                    GuardStreamError::InputRejected(reason),
                )
                .await;
            }
            Err(e) => {
                error!(error = %e, "input validation fault");
                return reject(&sink, INTERNAL_ERROR_MESSAGE, e).await;
            }
        }

        let connection_id = Uuid::new_v4();
        let span = info_span!("connection", %connection_id);
        let summary = self
            .run(connection_id, prompt, source, sink)
            .instrument(span)
            .await;
        Ok(summary)
    }

    /// Route `request` to its backend and serve it.
    pub async fn handle(
        &self,
        request: GenerateRequest,
        router: &ModelRouter,
        sink: mpsc::Sender<ClientMessage>,
    ) -> Result<StreamSummary, GuardStreamError> {
        let routed = match router.resolve(&request) {
            Ok(routed) => routed,
            Err(e) => {
                let message = match &e {
                    GuardStreamError::InvalidRequest(_) => PROMPT_REQUIRED_MESSAGE,
                    GuardStreamError::UnknownModel(_) => UNKNOWN_MODEL_MESSAGE,
                    _ => INTERNAL_ERROR_MESSAGE,
                };
                return reject(&sink, message, e).await;
            }
        };

        let backend = match HttpBackend::new(routed.route) {
            Ok(backend) => backend,
            Err(e) => {
                error!(error = %e, "could not build backend client");
                return reject(&sink, INTERNAL_ERROR_MESSAGE, e).await;
            }
        };

        self.serve(&routed.prompt, &backend, sink).await
    }

    /// Serve a connection in the background and return its messages as a
    /// stream. Must be called from within a tokio runtime.
    pub fn stream<S>(&self, prompt: impl Into<String>, source: S) -> ReceiverStream<ClientMessage>
    where
        S: TokenSource + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity);
        let pipeline = self.clone();
        let prompt = prompt.into();

        tokio::spawn(async move {
            if let Err(e) = pipeline.serve(&prompt, &source, tx).await {
                debug!(error = %e, "stream rejected before generation");
            }
        });

        ReceiverStream::new(rx)
    }

    async fn run<S>(
        &self,
        connection_id: Uuid,
        prompt: &str,
        source: &S,
        sink: mpsc::Sender<ClientMessage>,
    ) -> StreamSummary
    where
        S: TokenSource + ?Sized,
    {
        let config = &self.config;
        let cancel = CancellationToken::new();

        let (token_tx, token_rx) = mpsc::channel(config.token_queue_capacity);
        let (chunk_tx, chunk_rx) = mpsc::channel(config.chunk_queue_capacity);
        // Every result holds an in-flight permit, so this never fills up.
        let (result_tx, result_rx) = mpsc::channel(config.max_in_flight + 1);

        let assembler = Assembler::new(config.max_chunk_chars, config.max_wait());
        let assembler = tokio::spawn(
            assembler
                .run(token_rx, chunk_tx, config.flush_check_interval(), cancel.clone())
                .in_current_span(),
        );

        let dispatcher =
            Dispatcher::new(self.validator.clone(), self.pool.clone(), config.max_in_flight)
                .light_forced_checks(config.light_forced_checks);
        let dispatcher = tokio::spawn(
            dispatcher
                .run(chunk_rx, result_tx, cancel.clone())
                .in_current_span(),
        );

        let writer = OrderedWriter::new();
        let delivery = writer.delivery();
        let fallback = sink.clone();
        let mut writer = tokio::spawn(
            writer
                .run(result_rx, sink, cancel.clone())
                .in_current_span(),
        );

        let ended = produce(source, prompt, token_tx, cancel.clone()).await;
        debug!(?ended, "producer finished");

        for (stage, handle) in [("assembler", assembler), ("dispatcher", dispatcher)] {
            if let Err(e) = handle.await {
                error!(stage, error = %e, "pipeline stage failed");
            }
        }

        let finished = match tokio::time::timeout(config.writer_timeout(), &mut writer).await {
            Ok(finished) => finished,
            Err(_) => {
                error!(
                    timeout_ms = config.writer_timeout_ms,
                    "writer did not finish in time"
                );
                writer.abort();
                cancel.cancel();
                writer.await
            }
        };
        let report = match finished {
            Ok(report) => report,
            Err(e) => {
                if !e.is_cancelled() {
                    error!(error = %e, "writer task failed");
                }
                cancel.cancel();
                if !delivery.terminal_sent() {
                    end_with_internal_error(fallback);
                }
                WriterReport {
                    outcome: StreamOutcome::Internal,
                    emitted: delivery.emitted(),
                }
            }
        };

        info!(
            outcome = ?report.outcome,
            chunks_emitted = report.emitted,
            "connection closed"
        );

        StreamSummary {
            connection_id,
            outcome: report.outcome,
            chunks_emitted: report.emitted,
        }
    }
}

/// Close a stream whose writer died before sending its terminal message.
///
/// Never waits on a slow client; a full sink gets the message from a
/// background task instead.
fn end_with_internal_error(sink: mpsc::Sender<ClientMessage>) {
    match sink.try_send(ClientMessage::error(INTERNAL_ERROR_MESSAGE)) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(message)) => {
            debug!("sink full, sending terminal error in the background");
            tokio::spawn(async move {
                let _ = sink.send(message).await;
            });
        }
    }
}

async fn reject(
    sink: &mpsc::Sender<ClientMessage>,
    message: &str,
    err: GuardStreamError,
) -> Result<StreamSummary, GuardStreamError> {
    let _ = sink.send(ClientMessage::error(message)).await;
    Err(err)
}

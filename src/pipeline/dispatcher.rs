//! Fans chunks out to validation workers under two concurrency caps.

use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::guard::{GuardMode, ValidationPolicy, ValidationResult, Validator};
use crate::pipeline::assembler::AssemblerOutput;
use crate::pipeline::writer::{InFlight, WriterInput};
use crate::types::{Chunk, Completeness, EndReason};

/// Validation workers shared by every connection of a process.
///
/// Cloning shares the same permits.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }
}

/// Per-connection dispatcher.
///
/// A chunk is only dispatched once the connection has a free in-flight
/// permit. That permit travels with the result and is released by the writer,
/// so validated-but-unemitted results count against the cap too.
pub struct Dispatcher {
    validator: Arc<dyn Validator>,
    pool: WorkerPool,
    in_flight: Arc<Semaphore>,
    light_forced_checks: bool,
}

impl Dispatcher {
    pub fn new(validator: Arc<dyn Validator>, pool: WorkerPool, max_in_flight: usize) -> Self {
        Self {
            validator,
            pool,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            light_forced_checks: false,
        }
    }

    pub fn light_forced_checks(mut self, enable: bool) -> Self {
        self.light_forced_checks = enable;
        self
    }

    pub fn policy_for(&self, chunk: &Chunk) -> ValidationPolicy {
        match chunk.completeness {
            Completeness::Forced if self.light_forced_checks => ValidationPolicy::Light,
            _ => ValidationPolicy::Full,
        }
    }

    /// Dispatch chunks until the assembler ends, then wait for every worker
    /// and pass the end marker on.
    ///
    /// On cancel, workers already validating are detached rather than
    /// aborted: each finishes its check, keeps its pool slot until then, and
    /// drops the result.
    pub async fn run(
        self,
        mut chunks: mpsc::Receiver<AssemblerOutput>,
        results: mpsc::Sender<WriterInput>,
        cancel: CancellationToken,
    ) {
        let mut workers = JoinSet::new();

        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    stand_down(&mut workers);
                    return;
                }
                next = chunks.recv() => next,
            };

            let chunk = match next {
                Some(AssemblerOutput::Chunk(chunk)) => chunk,
                Some(AssemblerOutput::End(reason)) => break reason,
                None => break EndReason::Interrupted,
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    stand_down(&mut workers);
                    return;
                }
                permit = self.in_flight.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                error!("in-flight semaphore closed");
                return;
            };

            // Reap finished workers so the set stays small on long streams.
            while let Some(Some(_)) = workers.join_next().now_or_never() {}

            let policy = self.policy_for(&chunk);
            trace!(sequence = chunk.sequence, ?policy, "dispatching chunk");
            workers.spawn(validate_chunk(
                self.validator.clone(),
                self.pool.clone(),
                chunk,
                policy,
                permit,
                results.clone(),
                cancel.clone(),
            ));
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stand_down(&mut workers);
                    return;
                }
                joined = workers.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        debug!(?reason, "all chunks validated");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = results.send(WriterInput::End(reason)) => {}
        }
    }
}

fn stand_down(workers: &mut JoinSet<()>) {
    if !workers.is_empty() {
        debug!(running = workers.len(), "connection cancelled, letting workers finish");
    }
    workers.detach_all();
}

async fn validate_chunk(
    validator: Arc<dyn Validator>,
    pool: WorkerPool,
    chunk: Chunk,
    policy: ValidationPolicy,
    permit: OwnedSemaphorePermit,
    results: mpsc::Sender<WriterInput>,
    cancel: CancellationToken,
) {
    let sequence = chunk.sequence;
    let worker = tokio::select! {
        _ = cancel.cancelled() => return,
        worker = pool.acquire() => worker,
    };
    let Some(worker) = worker else {
        let _ = results
            .send(WriterInput::Fault {
                sequence,
                detail: "worker pool closed".to_string(),
            })
            .await;
        return;
    };

    let text = chunk.text;
    let checked = {
        let text = text.clone();
        // The pool slot stays taken until the validator returns, even if
        // this task goes away first.
        tokio::task::spawn_blocking(move || {
            let _worker = worker;
            validator.validate(&text, GuardMode::Output, policy)
        })
        .await
    };

    if cancel.is_cancelled() {
        trace!(sequence, "discarding result of cancelled connection");
        return;
    }

    let input = match checked {
        Ok(Ok(outcome)) => WriterInput::Validated(InFlight::new(
            ValidationResult {
                sequence,
                text,
                outcome,
            },
            permit,
        )),
        Ok(Err(e)) => WriterInput::Fault {
            sequence,
            detail: e.to_string(),
        },
        Err(e) => WriterInput::Fault {
            sequence,
            detail: e.to_string(),
        },
    };

    let _ = results.send(input).await;
}

//! Re-emits validation results in sequence order and enforces abort.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::guard::{ValidationOutcome, ValidationResult};
use crate::types::{
    ClientMessage, EndReason, StreamOutcome, BACKEND_FAILED_MESSAGE, BLOCKED_MESSAGE,
    INTERNAL_ERROR_MESSAGE,
};

/// A validation result still holding its connection's in-flight permit.
///
/// The permit is released when the writer emits or discards the result, so a
/// connection never has more than its in-flight cap of results parked here.
#[derive(Debug)]
pub struct InFlight {
    pub result: ValidationResult,
    _permit: Option<OwnedSemaphorePermit>,
}

impl InFlight {
    pub fn new(result: ValidationResult, permit: OwnedSemaphorePermit) -> Self {
        Self {
            result,
            _permit: Some(permit),
        }
    }

    /// A result not tied to any concurrency budget.
    pub fn detached(result: ValidationResult) -> Self {
        Self {
            result,
            _permit: None,
        }
    }
}

/// Messages the writer accepts.
#[derive(Debug)]
pub enum WriterInput {
    Validated(InFlight),
    /// Validation of this chunk failed internally; no verdict exists.
    Fault { sequence: u64, detail: String },
    End(EndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Streaming,
    Aborted,
    Drained,
}

impl WriterState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WriterState::Streaming)
    }
}

/// What has reached the client so far, readable after the writer task is gone.
#[derive(Debug, Default)]
pub struct Delivery {
    emitted: AtomicU64,
    terminal_sent: AtomicBool,
}

impl Delivery {
    /// Chunks the client has been sent.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Acquire)
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    fn record(&self, message: &ClientMessage) {
        if message.is_terminal() {
            self.terminal_sent.store(true, Ordering::Release);
        } else {
            self.emitted.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// The reordering state machine for one connection.
pub struct OrderedWriter {
    state: WriterState,
    expected: u64,
    pending: BTreeMap<u64, InFlight>,
    outcome: Option<StreamOutcome>,
    delivery: Arc<Delivery>,
}

impl Default for OrderedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedWriter {
    pub fn new() -> Self {
        Self {
            state: WriterState::Streaming,
            expected: 0,
            pending: BTreeMap::new(),
            outcome: None,
            delivery: Arc::new(Delivery::default()),
        }
    }

    /// Shared record of what `run` has delivered.
    pub fn delivery(&self) -> Arc<Delivery> {
        Arc::clone(&self.delivery)
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Next sequence number allowed out.
    pub fn expected_sequence(&self) -> u64 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.outcome
    }

    /// Feed one input; returns the messages to send, in order.
    ///
    /// Once terminal, every further input is dropped.
    pub fn accept(&mut self, input: WriterInput) -> Vec<ClientMessage> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        match input {
            WriterInput::Validated(in_flight) => {
                let sequence = in_flight.result.sequence;
                if let ValidationOutcome::Invalid(reason) = &in_flight.result.outcome {
                    warn!(sequence, %reason, "output chunk failed validation");
                    return self.abort(StreamOutcome::Blocked { sequence }, BLOCKED_MESSAGE);
                }
                if sequence < self.expected || self.pending.contains_key(&sequence) {
                    debug!(sequence, "duplicate result ignored");
                    return Vec::new();
                }
                self.pending.insert(sequence, in_flight);
                self.drain_ready()
            }
            WriterInput::Fault { sequence, detail } => {
                error!(sequence, %detail, "validation fault");
                self.abort(StreamOutcome::Internal, INTERNAL_ERROR_MESSAGE)
            }
            WriterInput::End(reason) => self.end(reason),
        }
    }

    /// The inbound channel closed without an end marker.
    pub fn interrupt(&mut self) -> Vec<ClientMessage> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        error!(expected = self.expected, "result channel closed early");
        self.abort(StreamOutcome::Internal, INTERNAL_ERROR_MESSAGE)
    }

    fn drain_ready(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Some(in_flight) = self.pending.remove(&self.expected) {
            out.push(ClientMessage::token(in_flight.result.text));
            self.expected += 1;
        }
        out
    }

    fn end(&mut self, reason: EndReason) -> Vec<ClientMessage> {
        if !self.pending.is_empty() {
            error!(
                expected = self.expected,
                parked = self.pending.len(),
                "end of stream with results missing"
            );
            return self.abort(StreamOutcome::Internal, INTERNAL_ERROR_MESSAGE);
        }
        match reason {
            EndReason::Completed => {
                self.state = WriterState::Drained;
                self.outcome = Some(StreamOutcome::Completed);
                vec![ClientMessage::end()]
            }
            EndReason::BackendFailed => {
                self.state = WriterState::Drained;
                self.outcome = Some(StreamOutcome::BackendFailed);
                vec![ClientMessage::error(BACKEND_FAILED_MESSAGE)]
            }
            EndReason::Interrupted => {
                self.abort(StreamOutcome::Internal, INTERNAL_ERROR_MESSAGE)
            }
        }
    }

    fn abort(&mut self, outcome: StreamOutcome, message: &str) -> Vec<ClientMessage> {
        self.state = WriterState::Aborted;
        self.outcome = Some(outcome);
        self.pending.clear();
        vec![ClientMessage::error(message)]
    }

    /// Consume results until terminal, forwarding messages to `sink`.
    ///
    /// Cancels the connection on the way out so upstream stages stop.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<WriterInput>,
        sink: mpsc::Sender<ClientMessage>,
        cancel: CancellationToken,
    ) -> WriterReport {
        let delivery = self.delivery();
        let outcome = loop {
            let next = tokio::select! {
                _ = sink.closed() => {
                    debug!(emitted = delivery.emitted(), "client went away while idle");
                    break StreamOutcome::Disconnected;
                }
                next = inbox.recv() => next,
            };
            let messages = match next {
                Some(input) => self.accept(input),
                None => self.interrupt(),
            };

            let mut disconnected = false;
            for message in messages {
                let sent = message.clone();
                if sink.send(message).await.is_err() {
                    disconnected = true;
                    break;
                }
                delivery.record(&sent);
            }
            if disconnected {
                debug!(emitted = delivery.emitted(), "client went away");
                break StreamOutcome::Disconnected;
            }

            if let Some(outcome) = self.outcome {
                break outcome;
            }
        };

        cancel.cancel();
        WriterReport {
            outcome,
            emitted: delivery.emitted(),
        }
    }
}

/// How the writer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterReport {
    pub outcome: StreamOutcome,
    pub emitted: u64,
}

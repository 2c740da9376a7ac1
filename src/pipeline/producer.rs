//! Reads the backend stream and feeds raw tokens to the assembler.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendEvent, TokenSource};
use crate::types::{EndReason, Token};

/// Pump tokens from `source` into `tokens` until the backend finishes.
///
/// Exactly one end marker follows the last token unless the connection is
/// cancelled first. Backend error details are logged here and never reach
/// the caller. Returns the end reason that was sent.
pub async fn produce<S>(
    source: &S,
    prompt: &str,
    tokens: mpsc::Sender<Token>,
    cancel: CancellationToken,
) -> Option<EndReason>
where
    S: TokenSource + ?Sized,
{
    let opened = tokio::select! {
        _ = cancel.cancelled() => return None,
        opened = source.open(prompt) => opened,
    };

    let reason = match opened {
        Err(e) => {
            warn!(error = %e, "backend request failed");
            EndReason::BackendFailed
        }
        Ok(mut stream) => {
            let mut forwarded = 0usize;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(forwarded, "producer cancelled");
                        return None;
                    }
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(BackendEvent::Token(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        if !send(&tokens, Token::Text(text), &cancel).await {
                            return None;
                        }
                        forwarded += 1;
                    }
                    Some(Ok(BackendEvent::Done)) => {
                        debug!(forwarded, "backend finished");
                        break EndReason::Completed;
                    }
                    Some(Ok(BackendEvent::Error(detail))) => {
                        warn!(%detail, forwarded, "backend reported an error");
                        break EndReason::BackendFailed;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, forwarded, "backend stream broke");
                        break EndReason::BackendFailed;
                    }
                    None => {
                        warn!(forwarded, "backend closed without an end marker");
                        break EndReason::BackendFailed;
                    }
                }
            }
        }
    };

    if send(&tokens, Token::End(reason), &cancel).await {
        Some(reason)
    } else {
        None
    }
}

async fn send(tokens: &mpsc::Sender<Token>, token: Token, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tokens.send(token) => sent.is_ok(),
    }
}

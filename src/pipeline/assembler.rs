//! Reassembles the raw token feed into validatable chunks.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::types::{Chunk, Completeness, EndReason, Token};

/// Decides where sentences end.
pub trait BoundaryDetector: Send + Sync {
    /// Byte offset just past the last sentence boundary in `text`, if any.
    fn last_boundary(&self, text: &str) -> Option<usize>;
}

/// Terminal punctuation followed by whitespace or end of text.
///
/// Closing quotes and brackets directly after the punctuation belong to the
/// sentence.
#[derive(Debug, Clone, Copy, Default)]
pub struct PunctuationBoundary;

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '»' | '”' | '’')
}

impl BoundaryDetector for PunctuationBoundary {
    fn last_boundary(&self, text: &str) -> Option<usize> {
        let mut last = None;
        let mut chars = text.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if !is_terminal(c) {
                continue;
            }
            while let Some(&(_, next)) = chars.peek() {
                if is_terminal(next) || is_closer(next) {
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                None => last = Some(text.len()),
                Some(&(idx, next)) if next.is_whitespace() => last = Some(idx),
                Some(_) => {}
            }
        }
        last
    }
}

/// What the assembler hands to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerOutput {
    Chunk(Chunk),
    End(EndReason),
}

/// Buffer plus flush policy.
///
/// Owns the sequence counter for its connection, so chunk numbers are
/// assigned in token-arrival order by a single writer.
pub struct Assembler<B = PunctuationBoundary> {
    buffer: String,
    last_flush: Instant,
    next_sequence: u64,
    max_chars: usize,
    max_wait: Duration,
    boundary: B,
}

impl Assembler<PunctuationBoundary> {
    pub fn new(max_chars: usize, max_wait: Duration) -> Self {
        Self::with_boundary(max_chars, max_wait, PunctuationBoundary)
    }
}

impl<B: BoundaryDetector> Assembler<B> {
    pub fn with_boundary(max_chars: usize, max_wait: Duration, boundary: B) -> Self {
        Self {
            buffer: String::new(),
            last_flush: Instant::now(),
            next_sequence: 0,
            max_chars,
            max_wait,
            boundary,
        }
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Sequence number the next chunk will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append a token and evaluate the flush conditions in priority order:
    /// sentence boundary, size cap, wait cap.
    ///
    /// The size cap also applies to what is left after a boundary flush, so
    /// one token can yield a complete chunk followed by a forced one.
    pub fn push(&mut self, token: &str, now: Instant) -> Vec<Chunk> {
        self.buffer.push_str(token);

        let mut ready = Vec::new();
        if let Some(end) = self.boundary.last_boundary(&self.buffer) {
            let rest = self.buffer.split_off(end);
            let text = std::mem::replace(&mut self.buffer, rest);
            ready.push(self.emit(text, Completeness::Complete, now));
        }
        if self.buffer.chars().count() >= self.max_chars {
            ready.extend(self.force(now));
        } else if ready.is_empty() {
            ready.extend(self.poll(now));
        }
        ready
    }

    /// Flush on the wait cap alone; called when no token arrived in time.
    pub fn poll(&mut self, now: Instant) -> Option<Chunk> {
        if now.saturating_duration_since(self.last_flush) >= self.max_wait {
            self.force(now)
        } else {
            None
        }
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self, now: Instant) -> Option<Chunk> {
        let chunk = self.force(now);
        self.buffer.clear();
        chunk
    }

    fn force(&mut self, now: Instant) -> Option<Chunk> {
        if self.buffer.trim().is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        Some(self.emit(text, Completeness::Forced, now))
    }

    fn emit(&mut self, text: String, completeness: Completeness, now: Instant) -> Chunk {
        let chunk = Chunk {
            sequence: self.next_sequence,
            text,
            completeness,
            received_at: Utc::now(),
        };
        self.next_sequence += 1;
        self.last_flush = now;
        chunk
    }

    /// Drive the assembler from the token feed until end of stream or abort.
    ///
    /// Waiting for a token is bounded by `check_every` so the wait cap fires
    /// even when the backend goes quiet.
    pub async fn run(
        mut self,
        mut tokens: mpsc::Receiver<Token>,
        chunks: mpsc::Sender<AssemblerOutput>,
        check_every: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(discarded = self.buffer.len(), "assembler cancelled");
                    return;
                }
                next = timeout(check_every, tokens.recv()) => next,
            };

            let (ready, end): (Vec<Chunk>, Option<EndReason>) = match next {
                Err(_elapsed) => (self.poll(Instant::now()).into_iter().collect(), None),
                Ok(Some(Token::Text(text))) => (self.push(&text, Instant::now()), None),
                Ok(Some(Token::End(reason))) => {
                    (self.finish(Instant::now()).into_iter().collect(), Some(reason))
                }
                Ok(None) => (
                    self.finish(Instant::now()).into_iter().collect(),
                    Some(EndReason::Interrupted),
                ),
            };

            for chunk in ready {
                trace!(sequence = chunk.sequence, completeness = ?chunk.completeness, "chunk ready");
                if !send(&chunks, AssemblerOutput::Chunk(chunk), &cancel).await {
                    return;
                }
            }

            if let Some(reason) = end {
                debug!(chunks = self.next_sequence, ?reason, "assembler drained");
                send(&chunks, AssemblerOutput::End(reason), &cancel).await;
                return;
            }
        }
    }
}

/// Send unless the connection is cancelled first. False means stop.
async fn send(
    chunks: &mpsc::Sender<AssemblerOutput>,
    output: AssemblerOutput,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = chunks.send(output) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> Assembler {
        Assembler::new(200, Duration::from_secs(2))
    }

    fn feed(assembler: &mut Assembler, tokens: &[&str]) -> Vec<Chunk> {
        let now = Instant::now();
        let mut out: Vec<Chunk> = tokens
            .iter()
            .flat_map(|t| assembler.push(t, now))
            .collect();
        out.extend(assembler.finish(now));
        out
    }

    #[test]
    fn test_boundary_detection() {
        let b = PunctuationBoundary;
        assert_eq!(b.last_boundary("Hello world"), None);
        assert_eq!(b.last_boundary("Hello world."), Some(12));
        assert_eq!(b.last_boundary("One. Two"), Some(4));
        assert_eq!(b.last_boundary("One. Two! Three"), Some(9));
        assert_eq!(b.last_boundary("pi is 3.14 ok"), None);
        assert_eq!(b.last_boundary("Really?!\" she said"), Some(9));
        assert_eq!(b.last_boundary("Wait…"), Some("Wait…".len()));
    }

    #[test]
    fn test_sentence_is_complete_chunk() {
        let mut a = assembler();
        let chunks = feed(&mut a, &["Hello", " world", "."]);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world.");
        assert_eq!(chunks[0].completeness, Completeness::Complete);
        assert_eq!(chunks[0].sequence, 0);
    }

    #[test]
    fn test_remainder_stays_buffered() {
        let mut a = assembler();
        let now = Instant::now();

        assert!(a.push("First one", now).is_empty());
        let chunks = a.push(". Second", now);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "First one.");
        assert_eq!(a.buffered(), " Second");
    }

    #[test]
    fn test_long_remainder_is_capped_after_boundary_flush() {
        let mut a = Assembler::new(10, Duration::from_secs(60));
        let now = Instant::now();

        let chunks = a.push("Short. and then a very long tail", now);
        let flushed: Vec<(&str, Completeness)> = chunks
            .iter()
            .map(|c| (c.text.as_str(), c.completeness))
            .collect();
        assert_eq!(
            flushed,
            vec![
                ("Short.", Completeness::Complete),
                (" and then a very long tail", Completeness::Forced),
            ]
        );
        assert_eq!(chunks[1].sequence, 1);
        assert_eq!(a.buffered(), "");
    }

    #[test]
    fn test_size_cap_forces_flush() {
        let mut a = Assembler::new(10, Duration::from_secs(60));
        let now = Instant::now();

        assert!(a.push("abcdef", now).is_empty());
        let chunks = a.push("ghijkl", now);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "abcdefghijkl");
        assert_eq!(chunks[0].completeness, Completeness::Forced);

        assert!(a.push("mn", now).is_empty());
        assert_eq!(a.buffered(), "mn");
        assert_eq!(a.next_sequence(), 1);
    }

    #[test]
    fn test_size_cap_counts_characters() {
        let mut a = Assembler::new(4, Duration::from_secs(60));
        let now = Instant::now();
        assert!(a.push("ééé", now).is_empty());
        assert_eq!(a.push("é", now).len(), 1);
    }

    #[test]
    fn test_wait_cap_forces_flush() {
        let mut a = Assembler::new(200, Duration::from_millis(1500));
        let start = Instant::now();

        assert!(a.push("slow", start).is_empty());
        assert!(a.poll(start + Duration::from_millis(1000)).is_none());
        let chunk = a.poll(start + Duration::from_millis(1600)).unwrap();
        assert_eq!(chunk.text, "slow");
        assert_eq!(chunk.completeness, Completeness::Forced);
    }

    #[test]
    fn test_whitespace_is_never_emitted() {
        let mut a = Assembler::new(3, Duration::from_millis(1));
        let start = Instant::now();

        assert!(a.push("    ", start).is_empty());
        assert!(a.poll(start + Duration::from_secs(1)).is_none());
        assert!(a.finish(start + Duration::from_secs(2)).is_none());
        assert_eq!(a.next_sequence(), 0);
    }

    #[test]
    fn test_chunks_concatenate_to_input() {
        let streams: &[&[&str]] = &[
            &["Hello", " world", ".", " How", " are", " you", "?", " Fine"],
            &["No boundaries at all in this rather long token stream"],
            &["A. B. C.", " D", "!", "\n", "E…", " 3.14 is pi", "."],
            &["Ünïcödé ", "tëxt. ", "Mörë", " hërë"],
        ];

        for tokens in streams {
            let mut a = Assembler::new(12, Duration::from_secs(60));
            let chunks = feed(&mut a, tokens);

            let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
            assert_eq!(rebuilt, tokens.concat().trim_end());

            let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
            let expected: Vec<u64> = (0..chunks.len() as u64).collect();
            assert_eq!(sequences, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_timeout_without_new_tokens() {
        let (token_tx, token_rx) = mpsc::channel(8);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            Assembler::new(200, Duration::from_millis(1500)).run(
                token_rx,
                chunk_tx,
                Duration::from_millis(100),
                cancel.clone(),
            ),
        );

        token_tx.send(Token::Text("thinking".into())).await.unwrap();
        match chunk_rx.recv().await.unwrap() {
            AssemblerOutput::Chunk(chunk) => {
                assert_eq!(chunk.text, "thinking");
                assert_eq!(chunk.completeness, Completeness::Forced);
            }
            other => panic!("Expected chunk, got {:?}", other),
        }

        token_tx.send(Token::End(EndReason::Completed)).await.unwrap();
        assert_eq!(
            chunk_rx.recv().await.unwrap(),
            AssemblerOutput::End(EndReason::Completed)
        );
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_flushes_tail_on_dropped_feed() {
        let (token_tx, token_rx) = mpsc::channel(8);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);

        let handle = tokio::spawn(assembler().run(
            token_rx,
            chunk_tx,
            Duration::from_millis(50),
            CancellationToken::new(),
        ));

        token_tx.send(Token::Text("half a thought".into())).await.unwrap();
        drop(token_tx);

        match chunk_rx.recv().await.unwrap() {
            AssemblerOutput::Chunk(chunk) => assert_eq!(chunk.text, "half a thought"),
            other => panic!("Expected chunk, got {:?}", other),
        }
        assert_eq!(
            chunk_rx.recv().await.unwrap(),
            AssemblerOutput::End(EndReason::Interrupted)
        );
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (token_tx, token_rx) = mpsc::channel(8);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(assembler().run(
            token_rx,
            chunk_tx,
            Duration::from_millis(50),
            cancel.clone(),
        ));

        token_tx.send(Token::Text("never sent".into())).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert!(chunk_rx.recv().await.is_none());
    }
}

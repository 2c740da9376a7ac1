//! Streaming HTTP client for a generation backend.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::backend::router::ModelRoute;
use crate::backend::{BackendEvent, BackendStream, TokenSource};
use crate::error::GuardStreamError;

/// [`TokenSource`] that POSTs to one routed model endpoint and decodes the
/// streamed body with the route's framing.
pub struct HttpBackend {
    route: ModelRoute,
    http_client: Client,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(route: ModelRoute) -> Result<Self, GuardStreamError> {
        Self::with_connect_timeout(route, Duration::from_secs(10))
    }

    /// Only connecting is bounded; generation itself may run long.
    pub fn with_connect_timeout(
        route: ModelRoute,
        timeout: Duration,
    ) -> Result<Self, GuardStreamError> {
        let http_client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            route,
            http_client,
            api_key: None,
        })
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn route(&self) -> &ModelRoute {
        &self.route
    }
}

#[async_trait]
impl TokenSource for HttpBackend {
    async fn open(&self, prompt: &str) -> Result<BackendStream, GuardStreamError> {
        let payload = self.route.payload(prompt);
        debug!(url = %self.route.url, model = %self.route.name, "opening backend stream");

        let mut builder = self
            .http_client
            .post(&self.route.url)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(key) = &self.api_key {
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

        let framing = self.route.framing;
        let events = lines(response.bytes_stream())
            .map(move |line| match line {
                Ok(line) => match framing.decode(&line) {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => {
                        debug!(error = %e, %line, "skipping undecodable backend line");
                        Vec::new()
                    }
                },
                Err(e) => vec![Err(e)],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }
}

/// Split a byte stream into lines.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// network chunks decode intact. A trailing partial line is yielded at the end.
fn lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, GuardStreamError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<GuardStreamError> + Send,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buffer: Vec<u8>,
        exhausted: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        exhausted: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..pos])
                    .trim_end_matches('\r')
                    .to_string();
                return Some((Ok(line), state));
            }
            if state.exhausted {
                if state.buffer.is_empty() {
                    return None;
                }
                let raw = std::mem::take(&mut state.buffer);
                let line = String::from_utf8_lossy(&raw).into_owned();
                return Some((Ok(line), state));
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.exhausted = true;
                    state.buffer.clear();
                    return Some((Err(e.into()), state));
                }
                None => state.exhausted = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::framing::Framing;
    use crate::backend::router::PayloadTemplate;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn route(server: &MockServer, framing: Framing) -> ModelRoute {
        ModelRoute {
            name: "llama-3.2".into(),
            url: format!("{}/llama3.2", server.uri()),
            backend_model: "llama3.2".into(),
            template: PayloadTemplate::Ollama,
            framing,
        }
    }

    async fn collect(stream: BackendStream) -> Vec<Result<BackendEvent, GuardStreamError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_lines_rejoins_split_utf8() {
        let parts: Vec<Result<Vec<u8>, GuardStreamError>> = vec![
            Ok(b"caf".to_vec()),
            Ok(vec![0xC3]),
            Ok(vec![0xA9, b'\n', b'x']),
            Ok(b"y\r\n".to_vec()),
            Ok(b"tail".to_vec()),
        ];
        let collected: Vec<String> = lines(futures::stream::iter(parts))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(collected, vec!["café", "xy", "tail"]);
    }

    #[tokio::test]
    async fn test_ollama_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"message\":{\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"content\":\" world.\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/llama3.2"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama3.2",
                "stream": true,
                "messages": [{"role": "user", "content": "Say hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(route(&server, Framing::OllamaNdjson)).unwrap();
        let events = collect(backend.open("Say hello").await.unwrap()).await;
        let events: Vec<BackendEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert_eq!(
            events,
            vec![
                BackendEvent::Token("Hello".into()),
                BackendEvent::Token(" world.".into()),
                BackendEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let server = MockServer::start().await;
        let body = "{\"token\":\"a\"}\n<html>oops</html>\n{\"token\":null}\n";
        Mock::given(method("POST"))
            .and(path("/llama3.2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(route(&server, Framing::TokenJson)).unwrap();
        let events: Vec<BackendEvent> = collect(backend.open("x").await.unwrap())
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(events, vec![BackendEvent::Token("a".into()), BackendEvent::Done]);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/llama3.2"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(route(&server, Framing::OllamaNdjson)).unwrap();
        match backend.open("x").await {
            Err(GuardStreamError::ApiError { status_code, .. }) => assert_eq!(status_code, 502),
            Err(other) => panic!("Expected ApiError, got {:?}", other),
            Ok(_) => panic!("Expected ApiError, got a stream"),
        }
    }
}

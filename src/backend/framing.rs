//! Line framings spoken by generation backends.

use serde::Deserialize;

use crate::backend::BackendEvent;
use crate::types::ClientMessage;

/// Wire framing of a backend's streamed response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One JSON object per line: `{"token": ..}` or `{"error": ..}`.
    TokenJson,
    /// Ollama chat streaming, newline-delimited JSON.
    OllamaNdjson,
    /// OpenAI-style server-sent events (also vLLM).
    OpenAiSse,
    /// Anthropic messages server-sent events.
    AnthropicSse,
}

#[derive(Debug, Deserialize)]
struct OllamaLine {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl Framing {
    /// Decode one line of a response body.
    ///
    /// Blank lines, SSE comments and `event:` lines decode to nothing.
    pub fn decode(&self, line: &str) -> Result<Vec<BackendEvent>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Framing::TokenJson => {
                let message: ClientMessage = serde_json::from_str(line)?;
                Ok(vec![match message {
                    ClientMessage::Token { token: Some(text) } => BackendEvent::Token(text),
                    ClientMessage::Token { token: None } => BackendEvent::Done,
                    ClientMessage::Error { error } => BackendEvent::Error(error),
                }])
            }
            Framing::OllamaNdjson => {
                let data: OllamaLine = serde_json::from_str(line)?;
                if let Some(error) = data.error {
                    return Ok(vec![BackendEvent::Error(error)]);
                }
                let mut events = Vec::new();
                if let Some(message) = data.message {
                    if !message.content.is_empty() {
                        events.push(BackendEvent::Token(message.content));
                    }
                }
                if data.done {
                    events.push(BackendEvent::Done);
                }
                Ok(events)
            }
            Framing::OpenAiSse => {
                let Some(payload) = sse_data(line) else {
                    return Ok(Vec::new());
                };
                if payload == "[DONE]" {
                    return Ok(vec![BackendEvent::Done]);
                }
                let data: OpenAiChunk = serde_json::from_str(payload)?;
                if let Some(error) = data.error {
                    return Ok(vec![BackendEvent::Error(error.message)]);
                }
                Ok(data
                    .choices
                    .into_iter()
                    .filter_map(|c| c.delta.and_then(|d| d.content))
                    .filter(|content| !content.is_empty())
                    .map(BackendEvent::Token)
                    .collect())
            }
            Framing::AnthropicSse => {
                let Some(payload) = sse_data(line) else {
                    return Ok(Vec::new());
                };
                let data: AnthropicEvent = serde_json::from_str(payload)?;
                Ok(match data.event_type.as_str() {
                    "content_block_delta" => data
                        .delta
                        .and_then(|d| d.text)
                        .filter(|text| !text.is_empty())
                        .map(BackendEvent::Token)
                        .into_iter()
                        .collect(),
                    "message_stop" => vec![BackendEvent::Done],
                    "error" => vec![BackendEvent::Error(
                        data.error.map(|e| e.message).unwrap_or_default(),
                    )],
                    _ => Vec::new(),
                })
            }
        }
    }
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

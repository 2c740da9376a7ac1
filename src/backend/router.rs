//! Maps a requested model name to a backend endpoint and request payload.

use serde_json::{json, Value};
use tracing::error;

use crate::backend::framing::Framing;
use crate::error::GuardStreamError;
use crate::types::{GenerateRequest, PROMPT_REQUIRED_MESSAGE};

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "llama-3.2";

/// Payload shape a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTemplate {
    Ollama,
    Anthropic,
    OpenAi,
    Vllm,
}

impl PayloadTemplate {
    /// Build the streaming request body for `prompt`.
    pub fn render(&self, model: &str, prompt: &str) -> Value {
        let messages = json!([{ "role": "user", "content": prompt }]);
        match self {
            PayloadTemplate::Ollama => json!({
                "model": model,
                "messages": messages,
                "stream": true
            }),
            PayloadTemplate::Anthropic => json!({
                "model": model,
                "system": "you are an assistant",
                "messages": messages,
                "stream": true,
                "max_tokens": 4096
            }),
            PayloadTemplate::OpenAi => json!({
                "model": model,
                "system": "you are an assistant",
                "messages": messages,
                "stream": true,
                "temperature": 0.7
            }),
            PayloadTemplate::Vllm => json!({
                "model": model,
                "system": "you are an assistant",
                "messages": messages,
                "stream": true
            }),
        }
    }
}

/// Where and how to reach one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    /// Name callers use to select the route.
    pub name: String,
    pub url: String,
    /// Model identifier sent in the payload.
    pub backend_model: String,
    pub template: PayloadTemplate,
    pub framing: Framing,
}

impl ModelRoute {
    pub fn payload(&self, prompt: &str) -> Value {
        self.template.render(&self.backend_model, prompt)
    }
}

/// A routed request: the trimmed prompt and the route that serves it.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub prompt: String,
    pub route: ModelRoute,
}

/// Registry of model routes.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    routes: Vec<ModelRoute>,
    default_model: String,
}

impl ModelRouter {
    /// An empty router; add routes with [`ModelRouter::route`].
    pub fn empty() -> Self {
        Self {
            routes: Vec::new(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// The stock model set, served under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base = base_url.trim_end_matches('/');
        let route = |name: &str, path: &str, model: &str, template, framing| ModelRoute {
            name: name.to_string(),
            url: format!("{}/{}", base, path),
            backend_model: model.to_string(),
            template,
            framing,
        };

        Self {
            routes: vec![
                route(
                    "llama-3.2",
                    "llama3.2",
                    "llama3.2",
                    PayloadTemplate::Ollama,
                    Framing::OllamaNdjson,
                ),
                route(
                    "claude-2",
                    "claude2",
                    "claude-2",
                    PayloadTemplate::Anthropic,
                    Framing::AnthropicSse,
                ),
                route(
                    "gpt-4",
                    "gpt4",
                    "gpt-4",
                    PayloadTemplate::OpenAi,
                    Framing::OpenAiSse,
                ),
                route(
                    "vllm",
                    "vllm",
                    "NousResearch/Meta-Llama-3-8B-Instruct",
                    PayloadTemplate::Vllm,
                    Framing::OpenAiSse,
                ),
            ],
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Add or replace a route. Names match case-insensitively.
    pub fn route(mut self, mut route: ModelRoute) -> Self {
        route.name = route.name.trim().to_lowercase();
        self.routes.retain(|r| r.name != route.name);
        self.routes.push(route);
        self
    }

    pub fn default_model(mut self, name: impl Into<String>) -> Self {
        self.default_model = name.into().to_lowercase();
        self
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.name.as_str())
    }

    /// Resolve a request to its route.
    pub fn resolve(&self, request: &GenerateRequest) -> Result<RoutedRequest, GuardStreamError> {
        let username = request.username.as_deref().unwrap_or("-");
        let ip = request.ip.as_deref().unwrap_or("-");

        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            error!(username, ip, "empty prompt");
            return Err(GuardStreamError::InvalidRequest(
                PROMPT_REQUIRED_MESSAGE.to_string(),
            ));
        }

        let requested = request
            .model
            .as_deref()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        match self.routes.iter().find(|r| r.name == requested) {
            Some(route) => Ok(RoutedRequest {
                prompt: prompt.to_string(),
                route: route.clone(),
            }),
            None => {
                error!(username, ip, model = %requested, "unknown model");
                Err(GuardStreamError::UnknownModel(requested))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_when_missing() {
        let router = ModelRouter::new("http://localhost:8765/");
        let routed = router.resolve(&GenerateRequest::new("  hi  ")).unwrap();

        assert_eq!(routed.prompt, "hi");
        assert_eq!(routed.route.name, "llama-3.2");
        assert_eq!(routed.route.url, "http://localhost:8765/llama3.2");
        assert_eq!(routed.route.framing, Framing::OllamaNdjson);
        assert_eq!(
            routed.route.payload(&routed.prompt),
            json!({
                "model": "llama3.2",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
        );
    }

    #[test]
    fn test_model_name_is_case_folded() {
        let router = ModelRouter::new("http://backend");
        let routed = router
            .resolve(&GenerateRequest::new("hi").model(" GPT-4 "))
            .unwrap();
        assert_eq!(routed.route.name, "gpt-4");
        let payload = routed.route.payload("hi");
        assert_eq!(payload["temperature"], json!(0.7));
        assert_eq!(payload["stream"], json!(true));
    }

    #[test]
    fn test_claude_and_vllm_templates() {
        let router = ModelRouter::new("http://backend");
        let claude = router
            .resolve(&GenerateRequest::new("q").model("claude-2"))
            .unwrap();
        assert_eq!(claude.route.payload("q")["max_tokens"], json!(4096));
        assert_eq!(claude.route.framing, Framing::AnthropicSse);

        let vllm = router.resolve(&GenerateRequest::new("q").model("vllm")).unwrap();
        assert_eq!(
            vllm.route.payload("q")["model"],
            json!("NousResearch/Meta-Llama-3-8B-Instruct")
        );
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let router = ModelRouter::new("http://backend");
        let err = router
            .resolve(&GenerateRequest::new("   ").username("ana"))
            .unwrap_err();
        assert!(matches!(err, GuardStreamError::InvalidRequest(msg) if msg == "Prompt is required"));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let router = ModelRouter::new("http://backend");
        let err = router
            .resolve(&GenerateRequest::new("hi").model("gemini-pro"))
            .unwrap_err();
        assert!(matches!(err, GuardStreamError::UnknownModel(name) if name == "gemini-pro"));
    }

    #[test]
    fn test_custom_route_replaces_existing() {
        let router = ModelRouter::empty()
            .route(ModelRoute {
                name: "echo".into(),
                url: "http://localhost:1/echo".into(),
                backend_model: "echo".into(),
                template: PayloadTemplate::Ollama,
                framing: Framing::TokenJson,
            })
            .default_model("echo");

        assert_eq!(router.models().collect::<Vec<_>>(), vec!["echo"]);
        let routed = router.resolve(&GenerateRequest::new("hi")).unwrap();
        assert_eq!(routed.route.framing, Framing::TokenJson);
    }

    #[test]
    fn test_custom_route_names_are_case_insensitive() {
        let router = ModelRouter::empty().route(ModelRoute {
            name: " Echo ".into(),
            url: "http://localhost:1/echo".into(),
            backend_model: "echo".into(),
            template: PayloadTemplate::Ollama,
            framing: Framing::TokenJson,
        });

        assert_eq!(router.models().collect::<Vec<_>>(), vec!["echo"]);
        let routed = router
            .resolve(&GenerateRequest::new("hi").model("ECHO"))
            .unwrap();
        assert_eq!(routed.route.name, "echo");
    }
}

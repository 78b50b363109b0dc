//! Model backend capability.
//!
//! The engine only needs "prompt in, text out, or a classified failure". The HTTP
//! implementation speaks to OpenAI-compatible chat endpoints and to Ollama.

use crate::model::PromptSystem;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Failure classes reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmErrorKind {
    Auth,
    Quota,
    Transport,
    Other,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmErrorKind::Auth => "auth",
            LlmErrorKind::Quota => "quota",
            LlmErrorKind::Transport => "transport",
            LlmErrorKind::Other => "upstream",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Prompt plus generation parameters for one call.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: Option<u32>,
}

impl<'a> GenerationRequest<'a> {
    pub fn for_system(system: &'a PromptSystem, prompt: &'a str) -> Self {
        Self {
            prompt,
            provider: &system.provider,
            model: &system.model,
            temperature: system.temperature,
            max_tokens: system.max_tokens,
            top_p: system.top_p,
            top_k: system.top_k,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, LlmError>;
}

/// Endpoint and credential settings for the HTTP client.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub ollama_host: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    settings: ProviderSettings,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
}

impl HttpLlmClient {
    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("prompt-regress/{}", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { http, settings })
    }

    async fn call_openai(&self, req: &GenerationRequest<'_>) -> Result<String, LlmError> {
        let key = self
            .settings
            .openai_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::new(LlmErrorKind::Auth, "OpenAI API key not configured"))?;
        let url = format!(
            "{}/chat/completions",
            self.settings.openai_base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: req.model,
            messages: [ChatMessage {
                role: "user",
                content: req.prompt,
            }],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
        };
        let resp = self
            .http
            .post(url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::new(LlmErrorKind::Other, format!("decode response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content.trim().to_string())
    }

    async fn call_ollama(&self, req: &GenerationRequest<'_>) -> Result<String, LlmError> {
        let url = format!("http://{}:11434/api/generate", self.settings.ollama_host);
        let body = OllamaRequest {
            model: req.model,
            prompt: req.prompt,
            options: OllamaOptions {
                temperature: req.temperature,
                top_p: req.top_p,
                top_k: req.top_k,
                num_predict: req.max_tokens,
            },
            stream: false,
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::new(LlmErrorKind::Other, format!("decode response: {e}")))?;
        Ok(parsed.response.trim().to_string())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, LlmError> {
        match request.provider {
            "openai" => self.call_openai(request).await,
            "ollama" => self.call_ollama(request).await,
            other => Err(LlmError::new(
                LlmErrorKind::Other,
                format!("unsupported provider: {other}"),
            )),
        }
    }
}

fn classify_transport(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::new(LlmErrorKind::Transport, format!("request timed out: {e}"))
    } else if e.is_connect() || e.is_request() {
        LlmError::new(LlmErrorKind::Transport, e.to_string())
    } else {
        LlmError::new(LlmErrorKind::Other, e.to_string())
    }
}

/// Map a non-success response onto an error class.
fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let lower = body.to_ascii_lowercase();
    let kind = if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || lower.contains("invalid_api_key")
    {
        LlmErrorKind::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS || lower.contains("quota") {
        LlmErrorKind::Quota
    } else if status == StatusCode::GATEWAY_TIMEOUT || status == StatusCode::REQUEST_TIMEOUT {
        LlmErrorKind::Transport
    } else {
        LlmErrorKind::Other
    };
    let snippet: String = body.chars().take(200).collect();
    LlmError::new(kind, format!("HTTP {}: {}", status.as_u16(), snippet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "").kind,
            LlmErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"code":"invalid_api_key"}"#).kind,
            LlmErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").kind,
            LlmErrorKind::Quota
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "").kind,
            LlmErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "You exceeded your quota").kind,
            LlmErrorKind::Quota
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "oops").kind,
            LlmErrorKind::Other
        );
    }

    #[tokio::test]
    async fn unsupported_provider_is_rejected() {
        let client = HttpLlmClient::new(ProviderSettings {
            openai_base_url: "http://127.0.0.1:9".into(),
            openai_api_key: None,
            ollama_host: "127.0.0.1".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let req = GenerationRequest {
            prompt: "hi",
            provider: "mystery",
            model: "m",
            temperature: 0.0,
            max_tokens: 8,
            top_p: 1.0,
            top_k: None,
        };
        let err = client.generate(&req).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Other);

        let req = GenerationRequest {
            provider: "openai",
            ..req
        };
        let err = client.generate(&req).await.unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Auth);
    }
}

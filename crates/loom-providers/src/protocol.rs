//! LLM protocol handles.
//!
//! Providers vary in wire protocol (openai-compatible, anthropic, ollama,
//! mock); the registry abstracts them behind the narrow [`LlmProtocol`]
//! capability and selects a handle per provider at registration time.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The requested model does not exist at the endpoint.
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ProtocolError {
    /// Whether this is the one error class the registry auto-recovers from.
    pub fn is_model_not_found(&self) -> bool {
        matches!(self, ProtocolError::ModelNotFound { .. })
    }
}

impl From<reqwest::Error> for ProtocolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProtocolError::Timeout
        } else {
            ProtocolError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Message / request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    /// Same request re-targeted at a different model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// LlmProtocol trait
// ---------------------------------------------------------------------------

/// The narrow capability every provider protocol exposes.
#[async_trait]
pub trait LlmProtocol: Send + Sync {
    /// Send a chat completion request and return the full response.
    async fn create_chat_completion(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProtocolError>;

    /// List the model names available at the endpoint.
    async fn get_models(&self) -> Result<Vec<String>, ProtocolError>;

    /// Human-readable protocol name (e.g. "openai-compatible", "mock").
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenAiCompatProtocol
// ---------------------------------------------------------------------------

/// Protocol handle for openai-compatible chat endpoints.
///
/// Also serves local, vllm, and ollama deployments, all of which expose the
/// `/v1/chat/completions` and `/v1/models` surface.
pub struct OpenAiCompatProtocol {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatProtocol {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        })
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    model: String,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait]
impl LlmProtocol for OpenAiCompatProtocol {
    async fn create_chat_completion(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProtocolError> {
        let body = Self::build_request_body(request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProtocolError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            // OpenAI-compatible servers signal a missing model with a 404 or
            // a 400/"model_not_found" body.
            if status == 404 || text.contains("model_not_found") {
                return Err(ProtocolError::ModelNotFound {
                    model: request.model.clone(),
                });
            }
            return Err(ProtocolError::Api {
                status,
                message: text,
            });
        }

        let api_resp: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProtocolError::Parse(e.to_string()))?;

        let choice = api_resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::Parse("response had no choices".into()))?;
        let usage = api_resp.usage.unwrap_or(CompletionUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            model: api_resp.model,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn get_models(&self) -> Result<Vec<String>, ProtocolError> {
        let url = format!("{}/v1/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Api {
                status,
                message: text,
            });
        }
        let models: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| ProtocolError::Parse(e.to_string()))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

// ---------------------------------------------------------------------------
// MockProtocol — scripted outcomes for tests
// ---------------------------------------------------------------------------

/// A protocol handle that replays scripted outcomes.
///
/// Completion calls pop from a queue of scripted results; when the queue is
/// empty a canned success is returned. The call counter lets tests assert
/// how many wire calls a registry operation made.
pub struct MockProtocol {
    script: Mutex<VecDeque<Result<ChatResponse, ProtocolError>>>,
    models: Mutex<Vec<String>>,
    calls: Mutex<u64>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            models: Mutex::new(vec!["mock-model".to_string()]),
            calls: Mutex::new(0),
        }
    }

    /// Queue a scripted outcome for the next completion call.
    pub fn push_outcome(&self, outcome: Result<ChatResponse, ProtocolError>) {
        self.script.lock().expect("script lock").push_back(outcome);
    }

    /// Replace the models list returned by `get_models`.
    pub fn set_models(&self, models: Vec<String>) {
        *self.models.lock().expect("models lock") = models;
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> u64 {
        *self.calls.lock().expect("calls lock")
    }

    fn canned_response(model: &str) -> ChatResponse {
        ChatResponse {
            content: "ok".into(),
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "stop".into(),
        }
    }
}

impl Default for MockProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProtocol for MockProtocol {
    async fn create_chat_completion(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProtocolError> {
        *self.calls.lock().expect("calls lock") += 1;
        let scripted = self.script.lock().expect("script lock").pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(Self::canned_response(&request.model)),
        }
    }

    async fn get_models(&self) -> Result<Vec<String>, ProtocolError> {
        Ok(self.models.lock().expect("models lock").clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let request = ChatRequest::new(
            "qwen3:32b",
            vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
        );
        let body = OpenAiCompatProtocol::build_request_body(&request);
        assert_eq!(body["model"], "qwen3:32b");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn with_model_retargets() {
        let request = ChatRequest::new("a", vec![ChatMessage::user("hi")]);
        let retargeted = request.with_model("b");
        assert_eq!(retargeted.model, "b");
        assert_eq!(retargeted.messages.len(), 1);
    }

    #[test]
    fn model_not_found_is_recoverable_class() {
        assert!(ProtocolError::ModelNotFound { model: "x".into() }.is_model_not_found());
        assert!(!ProtocolError::Timeout.is_model_not_found());
    }

    #[tokio::test]
    async fn mock_replays_script_then_canned() {
        let mock = MockProtocol::new();
        mock.push_outcome(Err(ProtocolError::Timeout));
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);

        let first = mock.create_chat_completion(&request).await;
        assert!(matches!(first, Err(ProtocolError::Timeout)));

        let second = mock.create_chat_completion(&request).await.unwrap();
        assert_eq!(second.content, "ok");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_models_list() {
        let mock = MockProtocol::new();
        mock.set_models(vec!["a".into(), "b".into()]);
        assert_eq!(mock.get_models().await.unwrap(), vec!["a", "b"]);
    }
}

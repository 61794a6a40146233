//! Language-model collaborator contract and the Ollama chat adapter.
//!
//! The adapter posts non-streaming requests to `/api/chat`. Hosted Ollama endpoints expect a
//! bearer token, which is attached when configured.

use crate::config::Config;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the language model collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Endpoint could not be reached or rejected the route.
    #[error("Language model unavailable: {0}")]
    ProviderUnavailable(String),
    /// Endpoint returned an error response.
    #[error("Language model request failed: {0}")]
    GenerationFailed(String),
    /// Endpoint response could not be parsed.
    #[error("Malformed language model response: {0}")]
    InvalidResponse(String),
}

/// Speaker of a chat message sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions framing the exchange.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
}

/// Single message in a model conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker of the message.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Interface implemented by chat model backends.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete the conversation and return the assistant reply text.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError>;
}

/// Chat client for Ollama-compatible `/api/chat` endpoints.
pub struct OllamaChatClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

impl OllamaChatClient {
    /// Construct a client from explicit settings.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        temperature: f32,
    ) -> Result<Self, LlmError> {
        let http = Client::builder()
            .user_agent("ragdesk/chat")
            .build()
            .map_err(|error| LlmError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            temperature,
        })
    }

    /// Construct a client from the runtime configuration.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        Self::new(
            config.llm_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
            config.llm_temperature,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OllamaChatClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": self.temperature,
            }
        });

        let mut request = self.http.post(self.endpoint()).json(&payload);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            LlmError::ProviderUnavailable(format!(
                "failed to reach {}: {error}",
                self.base_url
            ))
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(LlmError::ProviderUnavailable(format!(
                "{} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::GenerationFailed(format!(
                "model endpoint returned {status}: {body}"
            )));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            LlmError::InvalidResponse(format!("failed to decode chat response: {error}"))
        })?;

        if !body.done {
            return Err(LlmError::InvalidResponse(
                "chat response incomplete (streaming not supported)".into(),
            ));
        }

        body.message
            .map(|message| message.content.trim().to_string())
            .ok_or_else(|| LlmError::InvalidResponse("chat response carried no message".into()))
    }
}

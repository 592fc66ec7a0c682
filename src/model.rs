//! Decision-model client abstraction.
//!
//! The engine consumes exactly two model operations: one chat call that may
//! return a structured tool call, and one vision call that annotates a
//! screenshot with candidate coordinates. The [`ModelClient`] trait is
//! object-safe so the engine can hold any backend behind
//! `Arc<dyn ModelClient>`.
//!
//! # Example
//!
//! ```rust,ignore
//! use webpilot::model::{HttpModelClient, ModelClient};
//!
//! let client = HttpModelClient::from_env("OPENAI_API_KEY")?;
//! let reply = client.chat(request).await?;
//! ```

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// One message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A tool the model may call, with a JSON-schema argument contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

/// One chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// "auto", "required", or a specific tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// What the model returned: a structured tool call, or plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelReply {
    /// A structured, named tool invocation with parsed JSON arguments.
    ToolCall { name: String, arguments: Value },
    /// Free text, returned when the model declined to call a tool.
    Text { content: String },
}

impl ModelReply {
    /// The tool name, if this is a tool call.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::ToolCall { name, .. } => Some(name),
            Self::Text { .. } => None,
        }
    }
}

/// Abstraction over the decision-model backend.
///
/// Timeouts and retries are owned by the caller (the decision maker), not
/// by implementations; a call here should run to completion or fail fast.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one chat completion, returning either a tool call or plain text.
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ModelReply>;

    /// Run one vision call over a screenshot, returning the analysis text.
    async fn vision(&self, image: &[u8], prompt: &str) -> anyhow::Result<String>;

    /// Human-readable model identifier.
    fn model_name(&self) -> &str;
}

// =============================================================================
// API Errors
// =============================================================================

/// Structured errors for the HTTP model backend.
#[derive(Error, Debug)]
pub enum ModelApiError {
    /// Rate limit exceeded - should retry with backoff.
    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// Authentication failed - check API key.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// API key not found in environment.
    #[error("API key not found in environment variable '{env_var}'")]
    ApiKeyNotFound { env_var: String },

    /// Invalid request - check prompt/parameters.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Server error - may be transient.
    #[error("Server error: {message}")]
    ServerError { message: String },

    /// Invalid response shape from the API.
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

impl ModelApiError {
    /// Check if this error indicates the request should be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ServerError { .. })
    }

    /// Parse an error from an HTTP status code and response body.
    #[must_use]
    pub fn from_response(status_code: u16, body: &str) -> Self {
        match status_code {
            429 => Self::RateLimited {
                message: body.to_string(),
            },
            401 => Self::AuthenticationFailed {
                message: body.to_string(),
            },
            400..=499 => Self::InvalidRequest {
                message: body.to_string(),
            },
            500..=599 => Self::ServerError {
                message: body.to_string(),
            },
            _ => Self::InvalidResponse {
                message: format!("HTTP {status_code}: {body}"),
            },
        }
    }
}

// =============================================================================
// HTTP client (OpenAI-compatible chat completions)
// =============================================================================

/// Model client backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    vision_model: String,
}

impl HttpModelClient {
    /// Default API base URL.
    pub const DEFAULT_API_BASE: &'static str = "https://api.openai.com/v1";

    /// Create a client with an explicit API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: Self::DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            vision_model: "gpt-4o".to_string(),
        }
    }

    /// Create a client reading the API key from the given environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ModelApiError::ApiKeyNotFound`] when the variable is unset.
    pub fn from_env(env_var: &str) -> Result<Self, ModelApiError> {
        let api_key = std::env::var(env_var).map_err(|_| ModelApiError::ApiKeyNotFound {
            env_var: env_var.to_string(),
        })?;
        Ok(Self::new(api_key))
    }

    /// Override the API base URL (for proxies or compatible backends).
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Override the chat model id.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the vision model id.
    #[must_use]
    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = model.into();
        self
    }

    async fn post_completions(&self, body: Value) -> anyhow::Result<Value> {
        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let api_err = ModelApiError::from_response(status.as_u16(), &text);
            warn!(status = status.as_u16(), "model API call failed");
            return Err(api_err.into());
        }

        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ModelReply> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = json!(choice);
            }
        }

        debug!(
            model = %request.model,
            message_count = request.messages.len(),
            "sending chat completion"
        );

        let reply = self.post_completions(body).await?;
        let message = &reply["choices"][0]["message"];

        if let Some(call) = message["tool_calls"]
            .as_array()
            .and_then(|calls| calls.first())
        {
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| ModelApiError::InvalidResponse {
                    message: "tool call without a function name".to_string(),
                })?
                .to_string();
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(raw_args).unwrap_or(Value::Null);
            return Ok(ModelReply::ToolCall { name, arguments });
        }

        let content = message["content"].as_str().ok_or_else(|| {
            ModelApiError::InvalidResponse {
                message: "no tool call and no content in reply".to_string(),
            }
        })?;
        Ok(ModelReply::Text {
            content: content.to_string(),
        })
    }

    async fn vision(&self, image: &[u8], prompt: &str) -> anyhow::Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let body = json!({
            "model": self.vision_model,
            "max_tokens": 1024,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{encoded}")
                    }}
                ]
            }]
        });

        debug!(model = %self.vision_model, bytes = image.len(), "sending vision call");

        let reply = self.post_completions(body).await?;
        let content = reply["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelApiError::InvalidResponse {
                message: "no content in vision reply".to_string(),
            })?;
        Ok(content.to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::system("a").role, "system");
        assert_eq!(ChatMessage::user("b").role, "user");
        assert_eq!(ChatMessage::assistant("c").role, "assistant");
    }

    #[test]
    fn test_model_reply_tool_name() {
        let call = ModelReply::ToolCall {
            name: "click".to_string(),
            arguments: json!({"selectors": ["#a"]}),
        };
        assert_eq!(call.tool_name(), Some("click"));

        let text = ModelReply::Text {
            content: "hello".to_string(),
        };
        assert_eq!(text.tool_name(), None);
    }

    #[test]
    fn test_api_error_from_response() {
        assert!(matches!(
            ModelApiError::from_response(429, "slow down"),
            ModelApiError::RateLimited { .. }
        ));
        assert!(matches!(
            ModelApiError::from_response(401, "bad key"),
            ModelApiError::AuthenticationFailed { .. }
        ));
        assert!(matches!(
            ModelApiError::from_response(503, "overloaded"),
            ModelApiError::ServerError { .. }
        ));
        assert!(matches!(
            ModelApiError::from_response(400, "bad request"),
            ModelApiError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_api_error_retryability() {
        assert!(ModelApiError::from_response(429, "x").is_retryable());
        assert!(ModelApiError::from_response(500, "x").is_retryable());
        assert!(!ModelApiError::from_response(401, "x").is_retryable());
        assert!(!ModelApiError::from_response(400, "x").is_retryable());
    }

    #[test]
    fn test_http_client_builders() {
        let client = HttpModelClient::new("key")
            .with_api_base("https://proxy.example/v1")
            .with_model("gpt-4o-mini");
        assert_eq!(client.api_base, "https://proxy.example/v1");
        assert_eq!(client.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_from_env_missing_key() {
        let err = HttpModelClient::from_env("WEBPILOT_TEST_NO_SUCH_KEY").unwrap_err();
        assert!(matches!(err, ModelApiError::ApiKeyNotFound { .. }));
    }
}

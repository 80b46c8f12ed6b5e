//! Chat-completion backends used to drive investigations.

mod openai;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use openai::OpenAiBackend;

/// A function the model may call. Built from a tool descriptor by
/// `agent::tool_to_function`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSignature {
    pub name: String,
    pub description: String,
    /// Absent when the tool schema declares no `type`.
    pub parameters: Option<Value>,
}

/// A function invocation requested by the model. `arguments` is the raw JSON
/// text the model produced and may be malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub functions: &'a [FunctionSignature],
    /// Nudges the backend towards calling a function this turn.
    pub prefer_tools: bool,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Tool calls of a kind other than `function`, dropped from `tool_calls`.
    pub skipped_tool_calls: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by reasoning backend")]
    RateLimited,
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },
    #[error("model not found: {message}")]
    ModelNotFound { message: String },
    #[error("backend error {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("request timed out after {duration_ms}ms")]
    NetworkTimeout { duration_ms: u64 },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },
}

impl LlmError {
    pub fn from_http_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed { message },
            404 => Self::ModelNotFound { message },
            429 => Self::RateLimited,
            s if s >= 500 => Self::ServerError { status: s, message },
            _ => Self::InvalidRequest { message },
        }
    }
}

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, LlmError>;
}

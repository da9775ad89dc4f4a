//! LLM client abstraction
//!
//! The agent loop talks to the model only through [`LlmClient`]. The model id
//! is an explicit argument on every call, taken from the task's config, so
//! concurrent tasks using different models never share ambient state.

pub mod client;
pub mod tools;

use async_trait::async_trait;
use thiserror::Error;

pub use client::ChatClient;
pub use tools::{agent_tools, parse_tool_calls_from_text, ChatMessage, FunctionCall, Tool, ToolCall};

/// Error type for chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("empty response from LLM endpoint")]
    EmptyResponse,
    #[error("LLM call timed out")]
    Timeout,
}

/// Chat-completion with tool calling.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatMessage, ChatError>;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for std::sync::Arc<T> {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatMessage, ChatError> {
        (**self).chat(model, messages, tools).await
    }
}

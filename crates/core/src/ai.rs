//! AI collaborator traits: blocking calls, chunk streams and tool calling.
//!
//! Provider-specific request/response formatting stays behind these traits;
//! the engines only see extracted text, chunk receivers and tool calls.

use crate::error::UpstreamError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Receiver side of a streamed AI response, one text piece per message.
///
/// Dropping the receiver tells the producer to stop.
pub type ChunkReceiver = mpsc::Receiver<std::result::Result<String, UpstreamError>>;

/// Result of a blocking AI call.
#[derive(Debug, Clone, PartialEq)]
pub struct AiResponse {
    /// The full provider response body.
    pub raw: serde_json::Value,
    /// Text extracted from the response; empty if none could be found.
    pub text: String,
}

impl AiResponse {
    /// The extracted text, falling back to the raw body when extraction
    /// produced nothing.
    pub fn content(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        match &self.raw {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Which provider endpoint a call targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiTarget {
    pub provider: String,
    pub path: String,
}

impl AiTarget {
    pub fn new(provider: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            path: path.into(),
        }
    }

    /// Reject empty providers and paths that are empty or traverse upward.
    pub fn validate(&self) -> std::result::Result<(), UpstreamError> {
        if self.provider.trim().is_empty() {
            return Err(UpstreamError::ProviderNotConfigured("provider is required".into()));
        }
        if self.path.trim().is_empty() {
            return Err(UpstreamError::InvalidPath("path is required".into()));
        }
        if self.path.contains("..") {
            return Err(UpstreamError::InvalidPath(format!(
                "path must not contain '..': {}",
                self.path
            )));
        }
        Ok(())
    }
}

/// A blocking and streaming AI backend.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// POST `body` to the provider endpoint and wait for the whole response.
    async fn call(&self, target: &AiTarget, body: &str) -> std::result::Result<AiResponse, UpstreamError>;

    /// POST `body` and receive the response as incremental text chunks.
    ///
    /// Default implementation calls `call()` and yields the text as a single chunk.
    async fn call_stream(&self, target: &AiTarget, body: &str) -> std::result::Result<ChunkReceiver, UpstreamError> {
        let response = self.call(target, body).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(response.content())).await;
        Ok(rx)
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One model turn: optional text plus any requested tool calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// A model that can answer with tool calls.
#[async_trait]
pub trait ToolCallingModel: Send + Sync {
    async fn next_turn(
        &self,
        prompt: &str,
        tools: &[ToolDefinition],
    ) -> std::result::Result<AssistantTurn, UpstreamError>;
}

//! Tool-calling model over an OpenAI-compatible chat completions endpoint.

use async_trait::async_trait;
use inkwell_config::ProviderConfig;
use inkwell_core::ai::{AssistantTurn, ToolCall, ToolCallingModel, ToolDefinition};
use inkwell_core::error::UpstreamError;
use std::time::Duration;
use tracing::{debug, warn};

pub struct OpenAiToolModel {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl OpenAiToolModel {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            client,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.default_model.clone().unwrap_or_else(|| "gpt-4o-mini".into()),
        )
    }

    fn request_body(&self, prompt: &str, tools: &[ToolDefinition]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

/// Parse a chat completion into an [`AssistantTurn`].
///
/// Tool arguments arrive as a JSON-encoded string; unparseable arguments are
/// kept as a plain string value.
pub fn parse_tool_turn(raw: &serde_json::Value) -> Result<AssistantTurn, UpstreamError> {
    let message = raw
        .pointer("/choices/0/message")
        .ok_or_else(|| UpstreamError::InvalidResponse("response has no choices[0].message".into()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, call)| {
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}");
                    ToolCall {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{i}")),
                        name: call
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: serde_json::from_str(arguments)
                            .unwrap_or_else(|_| serde_json::Value::String(arguments.to_string())),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(AssistantTurn { content, tool_calls })
}

#[async_trait]
impl ToolCallingModel for OpenAiToolModel {
    async fn next_turn(&self, prompt: &str, tools: &[ToolDefinition]) -> Result<AssistantTurn, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&self.request_body(prompt, tools));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        debug!(model = %self.model, tools = tools.len(), "Requesting tool-calling turn");
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "Tool-calling request failed");
            return Err(UpstreamError::Status {
                status_code: status.as_u16(),
                body: text,
            });
        }

        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        parse_tool_turn(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tool_calls_with_string_arguments() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "lookup_character", "arguments": "{\"name\":\"Ada\"}" }
                    }]
                }
            }]
        });
        let turn = parse_tool_turn(&raw).unwrap();
        assert_eq!(turn.content, "");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_abc");
        assert_eq!(turn.tool_calls[0].arguments["name"], "Ada");
    }

    #[test]
    fn plain_answer_has_no_tool_calls() {
        let raw = json!({ "choices": [{ "message": { "content": "The end." } }] });
        let turn = parse_tool_turn(&raw).unwrap();
        assert_eq!(turn.content, "The end.");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn missing_message_is_invalid() {
        assert!(matches!(
            parse_tool_turn(&json!({ "error": "boom" })),
            Err(UpstreamError::InvalidResponse(_))
        ));
    }

    #[test]
    fn request_includes_tool_schemas() {
        let model = OpenAiToolModel::new("http://localhost:11434/v1/", None, "llama3");
        let body = model.request_body(
            "Who is Ada?",
            &[ToolDefinition {
                name: "lookup_character".into(),
                description: "Find a character".into(),
                parameters: json!({ "type": "object" }),
            }],
        );
        assert_eq!(body["tools"][0]["function"]["name"], "lookup_character");
        assert_eq!(body["messages"][0]["content"], "Who is Ada?");
        assert_eq!(model.base_url, "http://localhost:11434/v1");
    }
}

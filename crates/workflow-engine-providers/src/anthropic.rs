// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anthropic (Claude) provider implementation.

use crate::traits::{ChatMessage, ChatResponse, ChatRole, ChatUsage, LLMProvider, ProviderError, ToolCallRequest, ToolContract};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlockOut>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockOut {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlockIn>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockIn {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicProvider {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ProviderError::Auth(err.to_string())
            } else if status == StatusCode::TOO_MANY_REQUESTS {
                ProviderError::RateLimitExceeded
            } else {
                ProviderError::Http(err.to_string())
            }
        } else {
            ProviderError::Http(err.to_string())
        }
    }

    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com/v1".to_string(), "2023-06-01".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self { client, api_key, base_url, api_version }
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::InvalidRequest("ANTHROPIC_API_KEY environment variable not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn to_wire_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system_parts = Vec::new();
        let mut wire = Vec::new();
        for msg in messages {
            match msg.role {
                ChatRole::System => system_parts.push(msg.content.clone()),
                ChatRole::User => {
                    wire.push(WireMessage { role: "user", content: vec![ContentBlockOut::Text { text: msg.content.clone() }] });
                }
                ChatRole::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(ContentBlockOut::Text { text: msg.content.clone() });
                    }
                    for call in &msg.tool_calls {
                        blocks.push(ContentBlockOut::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: serde_json::Value::Object(call.arguments.clone()),
                        });
                    }
                    wire.push(WireMessage { role: "assistant", content: blocks });
                }
                ChatRole::Tool => {
                    let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
                    wire.push(WireMessage {
                        role: "user",
                        content: vec![ContentBlockOut::ToolResult { tool_use_id, content: msg.content.clone() }],
                    });
                }
            }
        }
        let system = if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) };
        (system, wire)
    }

    fn to_wire_tools(tools: &[ToolContract]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|t| WireTool { name: t.name.clone(), description: t.description.clone(), input_schema: t.parameters.clone() })
            .collect()
    }

    fn parse_error(status: StatusCode, body: &str) -> ProviderError {
        if let Ok(resp) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = resp.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || error.error_type == "authentication_error"
                || error.error_type == "permission_error"
            {
                return ProviderError::Auth(error.message);
            }
            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::Http(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        tools: &[ToolContract],
    ) -> Result<ChatResponse, ProviderError> {
        let (system, wire_messages) = Self::to_wire_messages(messages);
        let request = MessagesRequest {
            model: model.to_string(),
            messages: wire_messages,
            max_tokens,
            system,
            tools: Self::to_wire_tools(tools),
        };

        tracing::debug!(model, messages = messages.len(), "sending anthropic messages request");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let body = response.text().await.unwrap_or_else(|_| "failed to read response body".to_string());

        if !status.is_success() {
            tracing::warn!(model, status = status.as_u16(), "anthropic messages request failed");
            return Err(Self::parse_error(status, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlockIn::Text { text } => content.push_str(&text),
                ContentBlockIn::ToolUse { id, name, input } => {
                    let arguments = match input {
                        serde_json::Value::Object(map) => map,
                        other => {
                            let mut map = serde_json::Map::new();
                            map.insert("value".to_string(), other);
                            map
                        }
                    };
                    tool_calls.push(ToolCallRequest { id, name, arguments });
                }
                ContentBlockIn::Other => {}
            }
        }

        Ok(ChatResponse {
            content,
            tool_calls,
            usage: Some(ChatUsage {
                prompt_tokens: Some(parsed.usage.input_tokens),
                completion_tokens: Some(parsed.usage.output_tokens),
                total_tokens: Some(parsed.usage.input_tokens + parsed.usage.output_tokens),
            }),
            headers,
        })
    }

    async fn count_tokens(&self, text: &str, _model: &str) -> Result<u64, ProviderError> {
        Ok((text.len() as f64 / 4.0).ceil() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_collected_separately_from_the_turn_list() {
        let messages = vec![ChatMessage::system("be terse"), ChatMessage::user("hi")];
        let (system, wire) = AnthropicProvider::to_wire_messages(&messages);
        assert_eq!(system, Some("be terse".to_string()));
        assert_eq!(wire.len(), 1);
    }

    #[test]
    fn tool_call_requests_become_tool_use_blocks() {
        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), serde_json::Value::String("a.rs".to_string()));
        let call = ToolCallRequest { id: "call_1".to_string(), name: "read_file".to_string(), arguments: args };
        let messages = vec![ChatMessage::assistant_with_tool_calls("", vec![call])];
        let (_, wire) = AnthropicProvider::to_wire_messages(&messages);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].content.len(), 1);
    }

    #[test]
    fn parses_rate_limit_error_body() {
        let body = r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let err = AnthropicProvider::parse_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(err, ProviderError::RateLimitExceeded));
    }

    #[test]
    fn parses_auth_error_body() {
        let body = r#"{"error":{"type":"authentication_error","message":"bad key"}}"#;
        let err = AnthropicProvider::parse_error(StatusCode::UNAUTHORIZED, body);
        assert!(matches!(err, ProviderError::Auth(msg) if msg == "bad key"));
    }

    #[tokio::test]
    async fn complete_chat_round_trips_against_a_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "content": [{"type": "text", "text": "hello there"}],
            "usage": {"input_tokens": 10, "output_tokens": 3}
        });
        let mock = server
            .mock("POST", "/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("retry-after", "7")
            .with_body(body.to_string())
            .create_async()
            .await;

        let provider =
            AnthropicProvider::with_base_url("test-key".to_string(), server.url(), "2023-06-01".to_string());
        let response = provider
            .complete_chat("claude-3-5-sonnet-20241022", &[ChatMessage::user("hi")], 128, &[])
            .await
            .expect("mock call should succeed");

        mock.assert_async().await;
        assert_eq!(response.content, "hello there");
        assert_eq!(response.usage.unwrap().total_tokens, Some(13));
        assert_eq!(response.headers.get("retry-after").map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn complete_chat_maps_429_status_to_rate_limit_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .with_status(429)
            .with_body(r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#)
            .create_async()
            .await;

        let provider =
            AnthropicProvider::with_base_url("test-key".to_string(), server.url(), "2023-06-01".to_string());
        let result = provider.complete_chat("claude-3-5-sonnet-20241022", &[ChatMessage::user("hi")], 128, &[]).await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ProviderError::RateLimitExceeded)));
    }
}

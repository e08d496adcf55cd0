// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI provider implementation.

use crate::traits::{ChatMessage, ChatResponse, ChatRole, ChatUsage, LLMProvider, ProviderError, ToolCallRequest, ToolContract};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl OpenAIProvider {
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
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self { client, api_key, base_url }
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::InvalidRequest("OPENAI_API_KEY environment variable not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn role_str(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }

    fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: Self::role_str(m.role),
                content: if m.content.is_empty() && !m.tool_calls.is_empty() { None } else { Some(m.content.clone()) },
                tool_call_id: m.tool_call_id.clone(),
                name: m.name.clone(),
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        kind: "function",
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: serde_json::to_string(&c.arguments).unwrap_or_default(),
                        },
                    })
                    .collect(),
            })
            .collect()
    }

    fn to_wire_tools(tools: &[ToolContract]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunctionDef { name: t.name.clone(), description: t.description.clone(), parameters: t.parameters.clone() },
            })
            .collect()
    }

    fn parse_error(status: StatusCode, body: &str) -> ProviderError {
        if let Ok(resp) = serde_json::from_str::<OpenAIErrorResponse>(body) {
            let error = resp.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_exceeded" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED || error.error_type == "invalid_api_key" {
                return ProviderError::Auth(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::Http(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        tools: &[ToolContract],
    ) -> Result<ChatResponse, ProviderError> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: Self::to_wire_messages(messages),
            max_tokens,
            tools: Self::to_wire_tools(tools),
        };

        tracing::debug!(model, messages = messages.len(), "sending openai chat completion request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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
            tracing::warn!(model, status = status.as_u16(), "openai chat completion request failed");
            return Err(Self::parse_error(status, &body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Serialization("no choices in response".to_string()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| {
                let arguments = serde_json::from_str::<serde_json::Value>(&c.function.arguments)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                ToolCallRequest { id: c.id, name: c.function.name, arguments }
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: Some(ChatUsage {
                prompt_tokens: Some(parsed.usage.prompt_tokens),
                completion_tokens: Some(parsed.usage.completion_tokens),
                total_tokens: Some(parsed.usage.total_tokens),
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
    fn assistant_tool_calls_carry_function_arguments_as_json_string() {
        let mut args = serde_json::Map::new();
        args.insert("query".to_string(), serde_json::Value::String("rust".to_string()));
        let call = ToolCallRequest { id: "call_1".to_string(), name: "search".to_string(), arguments: args };
        let messages = vec![ChatMessage::assistant_with_tool_calls("", vec![call])];
        let wire = OpenAIProvider::to_wire_messages(&messages);
        assert_eq!(wire[0].content, None);
        assert_eq!(wire[0].tool_calls[0].function.name, "search");
        assert!(wire[0].tool_calls[0].function.arguments.contains("rust"));
    }

    #[test]
    fn tool_role_messages_keep_their_tool_call_id() {
        let messages = vec![ChatMessage::tool_result("call_1", "search", "{}")];
        let wire = OpenAIProvider::to_wire_messages(&messages);
        assert_eq!(wire[0].role, "tool");
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn parses_rate_limit_error_body() {
        let body = r#"{"error":{"message":"slow down","type":"rate_limit_exceeded"}}"#;
        let err = OpenAIProvider::parse_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(err, ProviderError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn complete_chat_round_trips_against_a_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hello there", "tool_calls": []}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
        });
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("x-ratelimit-remaining-requests", "42")
            .with_body(body.to_string())
            .create_async()
            .await;

        let provider = OpenAIProvider::with_base_url("test-key".to_string(), server.url());
        let response = provider
            .complete_chat("gpt-4o-mini", &[ChatMessage::user("hi")], 128, &[])
            .await
            .expect("mock call should succeed");

        mock.assert_async().await;
        assert_eq!(response.content, "hello there");
        assert_eq!(response.usage.unwrap().total_tokens, Some(13));
        assert_eq!(response.headers.get("x-ratelimit-remaining-requests").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn complete_chat_maps_429_status_to_rate_limit_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"slow down","type":"rate_limit_exceeded"}}"#)
            .create_async()
            .await;

        let provider = OpenAIProvider::with_base_url("test-key".to_string(), server.url());
        let result = provider.complete_chat("gpt-4o-mini", &[ChatMessage::user("hi")], 128, &[]).await;

        mock.assert_async().await;
        assert!(matches!(result, Err(ProviderError::RateLimitExceeded)));
    }
}

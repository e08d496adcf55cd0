// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The narrow provider interface LLM-backed steps and the router's
//! fallback loop call against. Deliberately minimal: a chat completion
//! call and a token counter, plus whatever response headers the caller
//! needs for rate-limit bookkeeping.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Present on assistant turns that requested tool calls, so the full
    /// exchange can be replayed back onto the wire format a provider
    /// actually expects (OpenAI's `tool_calls` array, Anthropic's
    /// `tool_use` content blocks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Default for ChatRole {
    fn default() -> Self {
        ChatRole::User
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// A model-requested tool invocation, already normalized from whatever
/// shape the provider used on the wire (OpenAI's `function.arguments` or
/// Anthropic's `tool_use.input`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContract {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<ChatUsage>,
    /// Raw response headers, lowercased, for rate-limit header parsing.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider error: {0}")]
    ProviderSpecific(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("request timed out")]
    Timeout,
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The entire surface a chat-completion backend must implement. Kept
/// deliberately narrow so new providers are a small adapter, not a
/// reimplementation of the engine's chat loop.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        tools: &[ToolContract],
    ) -> Result<ChatResponse, ProviderError>;

    async fn count_tokens(&self, text: &str, model: &str) -> Result<u64, ProviderError>;
}

/// Resolves a model id to the [`LLMProvider`] that serves it. Registered
/// by model-id prefix (`"gpt-"`, `"claude-"`) rather than exact id, so a
/// fallback chain can mix models from one provider family without a
/// per-model registration.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_prefix: Vec<(String, Arc<dyn LLMProvider>)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model_prefix: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        self.by_prefix.push((model_prefix.into(), provider));
    }

    pub fn resolve(&self, model: &str) -> Option<Arc<dyn LLMProvider>> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, p)| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubProvider(&'static str);

    #[async_trait]
    impl LLMProvider for StubProvider {
        fn name(&self) -> &str {
            self.0
        }

        async fn complete_chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _tools: &[ToolContract],
        ) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse::default())
        }

        async fn count_tokens(&self, text: &str, _model: &str) -> Result<u64, ProviderError> {
            Ok(text.len() as u64 / 4)
        }
    }

    #[test]
    fn resolves_by_first_matching_registered_prefix() {
        let mut registry = ProviderRegistry::new();
        registry.register("gpt-", Arc::new(StubProvider("openai")));
        registry.register("claude-", Arc::new(StubProvider("anthropic")));
        assert_eq!(registry.resolve("gpt-4o").unwrap().name(), "openai");
        assert_eq!(registry.resolve("claude-3-opus").unwrap().name(), "anthropic");
        assert!(registry.resolve("llama-3").is_none());
    }
}

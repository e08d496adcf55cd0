// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM provider integrations for the workflow engine.

pub mod anthropic;
pub mod openai;
pub mod traits;

// Re-exports
pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;
pub use traits::{
    ChatMessage, ChatResponse, ChatRole, ChatUsage, LLMProvider, ProviderError, ProviderRegistry,
    ToolCallRequest, ToolContract,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider trait definitions (re-exported from core).

pub use workflow_engine_core::providers::{
    ChatMessage, ChatResponse, ChatRole, ChatUsage, LLMProvider, ProviderError, ProviderRegistry,
    ToolCallRequest, ToolContract,
};

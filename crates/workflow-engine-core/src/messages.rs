// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent Message data model.

use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    Response,
    Error,
    Status,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub role: String,
    pub content: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentMessage {
    pub fn new(message_type: MessageType, role: impl Into<String>, content: Value) -> Self {
        Self {
            message_type,
            role: role.into(),
            content,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn new_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }
}

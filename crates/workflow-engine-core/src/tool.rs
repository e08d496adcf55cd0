// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool interface: the surface LLM-backed steps call into when a
//! model requests a tool. No concrete tools ship; callers register their
//! own against the registry.

use crate::error::Result;
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub execution_time_ms: Option<u64>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: BTreeMap::new(),
            execution_time_ms: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            metadata: BTreeMap::new(),
            execution_time_ms: None,
        }
    }
}

/// A callable tool a model can invoke mid-conversation. `schema` is an
/// OpenAI-style JSON Schema `parameters` object describing its inputs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    /// Minimum tier allowed to call this tool.
    fn min_tier(&self) -> u8 {
        0
    }
    async fn call(&self, args: BTreeMap<String, Value>) -> Result<ToolResult>;
}

/// Read-only-after-startup registry of tools available to LLM-backed
/// steps.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn allowed_for_tier(&self, tier: u8, allowlist: Option<&[String]>) -> Vec<Arc<dyn Tool>> {
        self.tools
            .values()
            .filter(|t| t.min_tier() <= tier)
            .filter(|t| allowlist.map(|names| names.iter().any(|n| n == t.name())).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct MockTool {
        pub name: String,
        pub response: ToolResult,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "mock tool for tests"
        }

        fn schema(&self) -> Value {
            Value::Map(BTreeMap::new())
        }

        async fn call(&self, _args: BTreeMap<String, Value>) -> Result<ToolResult> {
            Ok(self.response.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockTool;
    use super::*;

    #[tokio::test]
    async fn registry_looks_up_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "echo".to_string(),
            response: ToolResult::ok(Value::String("hi".to_string())),
        }));
        let tool = registry.get("echo").expect("registered");
        let result = tool.call(BTreeMap::new()).await.unwrap();
        assert!(result.success);
    }

    #[test]
    fn allowed_for_tier_filters_by_min_tier_and_allowlist() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool {
            name: "echo".to_string(),
            response: ToolResult::ok(Value::Null),
        }));
        let allowed = registry.allowed_for_tier(0, Some(&["other".to_string()]));
        assert!(allowed.is_empty());
        let allowed = registry.allowed_for_tier(0, None);
        assert_eq!(allowed.len(), 1);
    }
}

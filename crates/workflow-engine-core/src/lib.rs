// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core DAG-based agentic workflow engine.

pub mod artifact_extractor;
pub mod capability;
pub mod context;
pub mod dag;
pub mod dag_executor;
pub mod error;
pub mod expr;
pub mod llm_step;
pub mod messages;
pub mod model_stats;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod review;
pub mod router;
pub mod run_logger;
pub mod step;
pub mod step_state;
pub mod tool;
pub mod value;
pub mod workflow_def;
pub mod workflow_executor;
pub mod workflow_result;

// Re-exports
pub use capability::{Capability, CapabilitySet, CapabilityType};
pub use context::{Checkpoint, ContextEvent, EventHandler, ExecutionContext, LoggingEventHandler, ServiceContainer};
pub use dag::DAG;
pub use dag_executor::DagExecutor;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use llm_step::{resolve_agent, LlmStepFunction, Tier0Parser};
pub use messages::{AgentMessage, MessageType};
pub use model_stats::{CircuitState, ModelStats};
pub use providers::{
    ChatMessage, ChatResponse, ChatRole, ChatUsage, LLMProvider, ProviderError, ProviderRegistry,
    ToolCallRequest, ToolContract,
};
pub use rate_limit::RateLimitTracker;
pub use retry::{BackoffStrategy, RetryConfig};
pub use review::{Finding, ReviewReport, ReviewStatus, Severity, TestGateStatus};
pub use router::{FallbackChain, ModelTier, SmartRouter};
pub use run_logger::RunLogger;
pub use step::{FnHook, StepDefinition, StepExecutor, StepFunction, StepHook};
pub use tool::{Tool, ToolRegistry, ToolResult};
pub use value::Value;
pub use workflow_def::{load_file, parse_definition, WorkflowDefinition};
pub use workflow_executor::WorkflowExecutor;
pub use workflow_result::{StepResult, StepStatus, WorkflowResult};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

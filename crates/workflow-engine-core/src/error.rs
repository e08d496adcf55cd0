// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared across the engine.

use std::time::Duration;

/// Classification of a failure, used for retry eligibility and Smart Router bookkeeping.
///
/// This replaces exception-driven dispatch: adapters and internal callers produce an
/// `ErrorKind` up front rather than branching on exception types at the call site.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Step exceeded its configured timeout. Never retried.
    TimeoutError,
    /// The step or workflow was cancelled externally. Never retried.
    CancelledError,
    /// Provider returned 429 / "rate limit". Retryable via fallback, not via plain retry.
    RateLimit,
    /// Provider-level I/O timeout (distinct from the step timeout).
    Timeout,
    /// Model not found / no access; the model is marked unavailable for the process.
    Permanent,
    /// Any other exception; eligible for retry per `retry_on`.
    Transient,
    /// Input or expression evaluation failure; fatal for the step.
    ValidationError,
    /// LLM response could not be parsed into the expected shape.
    ParseError,
}

impl ErrorKind {
    /// Whether this kind of error is ever eligible for a plain step retry.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimit | ErrorKind::ParseError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::CancelledError => "CancelledError",
            ErrorKind::RateLimit => "RateLimit",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Permanent => "Permanent",
            ErrorKind::Transient => "Transient",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ParseError => "ParseError",
        };
        write!(f, "{}", s)
    }
}

/// Classifies a raw error message the way the Smart Router and LLM Step Factory do:
/// substring match on the lowercased text.
pub fn classify_error_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ErrorKind::RateLimit
    } else if lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("not found") || lower.contains("no access") {
        ErrorKind::Permanent
    } else {
        ErrorKind::Transient
    }
}

/// The engine's error sum type.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("step '{0}' not found in DAG")]
    StepNotFound(String),

    #[error("step '{name}' already exists in DAG")]
    DuplicateStep { name: String },

    #[error("missing dependency: step '{from}' depends on undefined step '{to}'")]
    MissingDependency { from: String, to: String },

    #[error("cycle detected in DAG: {path:?}")]
    CycleDetected { path: Vec<String> },

    #[error("DAG has no steps")]
    EmptyDag,

    #[error("step '{step_name}' has invalid configuration: {reason}")]
    InvalidStepConfig { step_name: String, reason: String },

    #[error("step '{step_name}' timed out after {duration:?}")]
    Timeout {
        step_name: String,
        duration: Duration,
    },

    #[error("step '{step_name}' was cancelled")]
    Cancelled { step_name: String },

    #[error("unsupported expression element: {0}")]
    UnsupportedExpression(String),

    #[error("failed to parse expression '{expr}': {reason}")]
    ExpressionParse { expr: String, reason: String },

    #[error("all models failed for tier {tier}: tried {tried:?}")]
    AllModelsFailed { tier: u8, tried: Vec<String> },

    #[error("no function defined for step '{0}'")]
    NoStepFunction(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn other(msg: impl Into<String>) -> Self {
        OrchestratorError::Other(msg.into())
    }

    /// Maps this error onto the engine's `ErrorKind` classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Timeout { .. } => ErrorKind::TimeoutError,
            OrchestratorError::Cancelled { .. } => ErrorKind::CancelledError,
            OrchestratorError::Validation(_) => ErrorKind::ValidationError,
            OrchestratorError::UnsupportedExpression(_)
            | OrchestratorError::ExpressionParse { .. } => ErrorKind::ValidationError,
            OrchestratorError::Provider(msg) => classify_error_message(msg),
            OrchestratorError::Other(msg) => classify_error_message(msg),
            _ => ErrorKind::Transient,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

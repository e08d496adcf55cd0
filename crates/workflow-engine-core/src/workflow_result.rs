// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step Result / Workflow Result data model.

use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Retrying,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Mutable record of a single step's execution. Created on schedule, finalized
/// on completion, never mutated afterward.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub input_data: BTreeMap<String, Value>,
    pub output_data: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// tokens_used, tool_calls, loop_iteration, skip_reason live here.
    pub metadata: BTreeMap<String, Value>,
}

impl StepResult {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            agent_role: None,
            tier: None,
            model_used: None,
            input_data: BTreeMap::new(),
            output_data: BTreeMap::new(),
            error: None,
            error_kind: None,
            start_time: Utc::now(),
            end_time: None,
            retry_count: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.metadata.get("skip_reason").and_then(|v| v.as_str())
    }
}

/// Aggregate result of a workflow run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub workflow_name: String,
    pub overall_status: StepStatus,
    pub steps: Vec<StepResult>,
    /// Merged context snapshot at completion.
    pub final_output: BTreeMap<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Workflow-level errors: timeout, global cancel, unexpected.
    pub metadata: BTreeMap<String, Value>,
}

impl WorkflowResult {
    pub fn new(run_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            overall_status: StepStatus::Running,
            steps: Vec::new(),
            final_output: BTreeMap::new(),
            start_time: Utc::now(),
            end_time: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_name.as_str())
            .collect()
    }

    /// Percentage of steps that completed successfully (0-100, not a 0-1
    /// fraction).
    pub fn success_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        let succeeded = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count();
        (succeeded as f64 / self.steps.len() as f64) * 100.0
    }

    pub fn total_duration_ms(&self) -> i64 {
        match self.end_time {
            Some(end) => (end - self.start_time).num_milliseconds(),
            None => 0,
        }
    }

    pub fn total_retries(&self) -> u32 {
        self.steps.iter().map(|s| s.retry_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_of_empty_workflow_is_full() {
        let result = WorkflowResult::new("run-1", "wf");
        assert_eq!(result.success_rate(), 100.0);
    }

    #[test]
    fn success_rate_counts_only_success_status() {
        let mut result = WorkflowResult::new("run-1", "wf");
        let mut a = StepResult::new("a");
        a.status = StepStatus::Success;
        let mut b = StepResult::new("b");
        b.status = StepStatus::Failed;
        result.steps.push(a);
        result.steps.push(b);
        assert_eq!(result.success_rate(), 50.0);
        assert_eq!(result.failed_steps(), vec!["b"]);
    }
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured JSON run records for offline evaluation: per-step
//! input/output/model/tier/duration/tokens/errors plus a per-workflow
//! rollup. Long string values are truncated at 10,000 characters so
//! generated code is captured in full for all but the largest outputs.

use crate::value::Value;
use crate::workflow_result::{StepResult, WorkflowResult};
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use tracing::info;

const TRUNCATE_LIMIT: usize = 10_000;

fn truncate(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) if s.chars().count() > TRUNCATE_LIMIT => {
            let truncated: String = s.chars().take(TRUNCATE_LIMIT).collect();
            JsonValue::String(format!("{}... ({} chars)", truncated, s.chars().count()))
        }
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().map(|(k, v)| (k, truncate(v))).collect())
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(truncate).collect()),
        other => other,
    }
}

fn value_map_to_json(map: &std::collections::BTreeMap<String, Value>) -> JsonValue {
    let converted: serde_json::Map<String, JsonValue> = map
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().into()))
        .collect();
    truncate(JsonValue::Object(converted))
}

pub fn build_step_record(step: &StepResult) -> JsonValue {
    let tokens_used = step.metadata.get("tokens_used").cloned().map(JsonValue::from);
    let metadata: serde_json::Map<String, JsonValue> = step
        .metadata
        .iter()
        .filter(|(k, _)| k.as_str() != "tokens_used")
        .map(|(k, v)| (k.clone(), v.clone().into()))
        .collect();

    json!({
        "step_name": step.step_name,
        "status": step.status,
        "agent_role": step.agent_role,
        "tier": step.tier,
        "model_used": step.model_used,
        "duration_ms": step.duration_ms(),
        "retry_count": step.retry_count,
        "tokens_used": tokens_used,
        "input": value_map_to_json(&step.input_data),
        "output": value_map_to_json(&step.output_data),
        "error": step.error,
        "error_type": step.error_kind,
        "start_time": step.start_time.to_rfc3339(),
        "end_time": step.end_time.map(|t| t.to_rfc3339()),
        "metadata": if metadata.is_empty() { JsonValue::Null } else { JsonValue::Object(metadata) },
    })
}

#[derive(Default)]
pub struct RunRecordOptions {
    pub dataset_meta: Option<JsonValue>,
    pub workflow_inputs: Option<std::collections::BTreeMap<String, Value>>,
    pub extra: Option<JsonValue>,
}

pub fn build_run_record(result: &WorkflowResult, options: &RunRecordOptions) -> JsonValue {
    let mut record = json!({
        "run_id": result.run_id,
        "workflow_name": result.workflow_name,
        "status": result.overall_status,
        "success_rate": result.success_rate(),
        "total_duration_ms": result.total_duration_ms(),
        "total_retries": result.total_retries(),
        "step_count": result.steps.len(),
        "failed_step_count": result.failed_steps().len(),
        "start_time": result.start_time.to_rfc3339(),
        "end_time": result.end_time.map(|t| t.to_rfc3339()),
        "dataset": options.dataset_meta,
        "inputs": options.workflow_inputs.as_ref().map(value_map_to_json),
        "steps": result.steps.iter().map(build_step_record).collect::<Vec<_>>(),
        "final_output": value_map_to_json(&result.final_output),
    });

    if let Some(extra) = &options.extra {
        record["extra"] = extra.clone();
    }
    record
}

/// Persists workflow run records as JSON files under `runs_dir`.
pub struct RunLogger {
    runs_dir: PathBuf,
}

impl RunLogger {
    pub fn new(runs_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let runs_dir = runs_dir.into();
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Serializes a result to a timestamped JSON file, returning its path.
    pub fn log(&self, result: &WorkflowResult, options: &RunRecordOptions) -> std::io::Result<PathBuf> {
        let record = build_run_record(result, options);
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let status = serde_json::to_value(result.overall_status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let filename = format!("{}_{}_{}.json", ts, result.workflow_name, status);
        let path = self.runs_dir.join(filename);
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        info!(path = %path.display(), "run logged");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow_result::StepStatus;

    #[test]
    fn truncate_marks_oversized_strings() {
        let long = "x".repeat(TRUNCATE_LIMIT + 1);
        let truncated = truncate(JsonValue::String(long.clone()));
        let s = truncated.as_str().unwrap();
        assert!(s.len() < long.len());
        assert!(s.ends_with("chars)"));
    }

    #[test]
    fn build_step_record_separates_tokens_used_from_metadata() {
        let mut step = StepResult::new("a");
        step.status = StepStatus::Success;
        step.metadata.insert("tokens_used".to_string(), Value::Number(42.0));
        step.metadata.insert("model_used".to_string(), Value::String("gpt".to_string()));
        let record = build_step_record(&step);
        assert_eq!(record["tokens_used"], json!(42.0));
        assert_eq!(record["metadata"]["model_used"], json!("gpt"));
        assert!(record["metadata"].get("tokens_used").is_none());
    }

    #[test]
    fn log_writes_a_json_file() {
        let dir = std::env::temp_dir().join(format!("workflow-engine-runlog-{}", uuid::Uuid::new_v4()));
        let logger = RunLogger::new(&dir).unwrap();
        let result = WorkflowResult::new("run1", "wf");
        let path = logger.log(&result, &RunRecordOptions::default()).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

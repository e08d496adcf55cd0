// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! YAML workflow definitions: serde-deserializable schema plus
//! conversion into a validated [`DAG`] of [`StepDefinition`]s.

use crate::dag::DAG;
use crate::error::{OrchestratorError, Result};
use crate::llm_step::resolve_agent;
use crate::retry::RetryConfig;
use crate::step::StepDefinition;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowInputSpec {
    #[serde(default = "default_input_type")]
    pub r#type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub r#enum: Option<Vec<String>>,
}

fn default_input_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WorkflowInputDef {
    Full(WorkflowInputSpec),
    Default(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowOutputSpec {
    pub from: serde_json::Value,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WorkflowOutputDef {
    Full(WorkflowOutputSpec),
    Expr(serde_json::Value),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkflowCapabilities {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub agent: Option<String>,
    pub when: Option<String>,
    pub unless: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub loop_until: Option<String>,
    pub loop_max: Option<serde_json::Value>,
    pub prompt_file: Option<String>,
    pub tools: Option<Vec<String>>,
    pub retry: Option<RetryConfig>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkflowDefinitionSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, WorkflowInputDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, WorkflowOutputDef>,
    #[serde(default)]
    pub capabilities: WorkflowCapabilities,
    /// Opaque: scoring rubrics/criteria are out of scope for this engine;
    /// passed through verbatim for a downstream scoring layer to consume.
    #[serde(default)]
    pub evaluation: Option<serde_json::Value>,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A fully parsed workflow: typed inputs/outputs plus a validated DAG
/// with each step's agent already resolved to an executable function.
pub struct WorkflowDefinition {
    pub name: String,
    pub description: String,
    pub version: String,
    pub inputs: BTreeMap<String, WorkflowInputSpec>,
    pub outputs: BTreeMap<String, WorkflowOutputSpec>,
    pub capabilities: WorkflowCapabilities,
    pub evaluation: Option<serde_json::Value>,
    pub experimental: bool,
    pub dag: DAG,
}

fn parse_input(def: &WorkflowInputDef) -> WorkflowInputSpec {
    match def {
        WorkflowInputDef::Full(spec) => spec.clone(),
        WorkflowInputDef::Default(value) => WorkflowInputSpec {
            r#type: default_input_type(),
            description: String::new(),
            default: Some(value.clone()),
            required: false,
            r#enum: None,
        },
    }
}

fn parse_output(def: &WorkflowOutputDef) -> WorkflowOutputSpec {
    match def {
        WorkflowOutputDef::Full(spec) => spec.clone(),
        WorkflowOutputDef::Expr(value) => WorkflowOutputSpec {
            from: value.clone(),
            optional: false,
        },
    }
}

fn parse_loop_max(raw: &Option<serde_json::Value>) -> u32 {
    match raw {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|v| v.max(1) as u32).unwrap_or(3),
        Some(serde_json::Value::String(s)) => s.parse::<u32>().map(|v| v.max(1)).unwrap_or(3),
        _ => 3,
    }
}

fn parse_step(spec: &StepSpec) -> Result<StepDefinition> {
    if spec.name.trim().is_empty() {
        return Err(OrchestratorError::InvalidStepConfig {
            step_name: spec.name.clone(),
            reason: "step must have a 'name' field".to_string(),
        });
    }

    let mut step = StepDefinition::new(&spec.name);
    step.description = spec.description.clone();
    step.depends_on = spec.depends_on.clone();
    step.when = spec.when.clone();
    step.unless = spec.unless.clone();
    step.loop_until = spec.loop_until.clone();
    step.loop_max = parse_loop_max(&spec.loop_max);
    if let Some(retry) = &spec.retry {
        step.retry = retry.clone();
    }
    step.timeout = spec.timeout_secs.map(std::time::Duration::from_secs);

    for (key, value) in &spec.inputs {
        if let serde_json::Value::String(expr) = value {
            step.input_mapping.insert(key.clone(), expr.clone());
        }
    }
    for (key, value) in &spec.outputs {
        if let serde_json::Value::String(field) = value {
            step.output_mapping.insert(key.clone(), field.clone());
        }
    }

    step.metadata.insert(
        "agent".to_string(),
        spec.agent.clone().map(Value::String).unwrap_or(Value::Null),
    );
    if let Some(prompt_file) = &spec.prompt_file {
        step.metadata.insert("prompt_file".to_string(), Value::String(prompt_file.clone()));
    }
    if let Some(tools) = &spec.tools {
        step.metadata.insert(
            "tools".to_string(),
            Value::List(tools.iter().map(|t| Value::String(t.clone())).collect()),
        );
    }

    Ok(step)
}

/// Parses a YAML document into a [`WorkflowDefinition`], binding each
/// step's agent metadata to an executable [`StepFunction`](crate::step::StepFunction)
/// and validating the resulting DAG.
pub fn parse_definition(source: &str, default_name: &str) -> Result<WorkflowDefinition> {
    let spec: WorkflowDefinitionSpec = serde_yaml::from_str(source).map_err(|e| {
        OrchestratorError::Validation(format!("invalid workflow YAML: {e}"))
    })?;

    let name = if spec.name.is_empty() { default_name.to_string() } else { spec.name.clone() };

    let inputs = spec.inputs.iter().map(|(k, v)| (k.clone(), parse_input(v))).collect();
    let outputs = spec.outputs.iter().map(|(k, v)| (k.clone(), parse_output(v))).collect();

    let mut dag = DAG::new(&name).with_description(spec.description.clone());
    for step_spec in &spec.steps {
        let mut step = parse_step(step_spec)?;
        resolve_agent(&mut step)?;
        dag.add(step)?;
    }

    if dag.steps.is_empty() {
        if spec.experimental {
            let mut placeholder = StepDefinition::new("experimental_placeholder");
            placeholder.description = "Placeholder step for experimental workflow".to_string();
            placeholder
                .metadata
                .insert("agent".to_string(), Value::String("tier0_parser".to_string()));
            resolve_agent(&mut placeholder)?;
            dag.add(placeholder)?;
        } else {
            return Err(OrchestratorError::Validation(format!(
                "workflow '{name}' has no executable steps"
            )));
        }
    }

    dag.validate(spec.experimental)?;

    Ok(WorkflowDefinition {
        name,
        description: spec.description,
        version: spec.version,
        inputs,
        outputs,
        capabilities: spec.capabilities,
        evaluation: spec.evaluation,
        experimental: spec.experimental,
        dag,
    })
}

pub fn load_file(path: &Path) -> Result<WorkflowDefinition> {
    let source = std::fs::read_to_string(path)?;
    let default_name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unnamed");
    parse_definition(&source, default_name)
}

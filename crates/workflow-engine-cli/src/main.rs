// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Command-line runner for the workflow engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workflow_engine_core::{
    load_file, FallbackChain, LoggingEventHandler, ModelTier, ProviderRegistry, RateLimitTracker,
    SmartRouter, ToolRegistry, Value, WorkflowExecutor,
};
use workflow_engine_providers::{AnthropicProvider, OpenAIProvider};

#[derive(Parser)]
#[command(name = "workflow-engine")]
#[command(version, about = "Agentic DAG workflow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition without running it
    Validate {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow to completion
    Run {
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string, or a path to a JSON file
        #[arg(short, long)]
        input: Option<String>,

        /// Maximum concurrent steps
        #[arg(long, default_value = "4")]
        max_concurrency: usize,

        /// Global wall-clock budget for the whole run, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Directory to persist the JSON run record to
        #[arg(long)]
        runs_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("workflow_engine={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, input, max_concurrency, timeout_secs, runs_dir } => {
            run_workflow(&file, input.as_deref(), max_concurrency, timeout_secs, runs_dir.as_deref()).await
        }
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("{} {e}", "Error:".red().bold());
        std::process::exit(1);
    }
}

fn validate_workflow(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);
    let definition =
        load_file(Path::new(file_path)).with_context(|| format!("failed to load workflow: {file_path}"))?;

    println!("{}", "\u{2713} Workflow is valid".green().bold());
    println!("  Name: {}", definition.name);
    println!("  Version: {}", definition.version);
    println!("  Steps: {}", definition.dag.steps.len());
    Ok(())
}

/// Registers whichever providers have credentials in the environment, and a
/// conservative default fallback chain per tier so a workflow can run with
/// no further configuration. A deployment with specific model preferences
/// is expected to build its own [`SmartRouter`] against the library crate
/// directly rather than go through this CLI.
fn build_router_and_providers() -> Result<(Arc<SmartRouter>, Arc<ProviderRegistry>)> {
    let mut providers = ProviderRegistry::new();
    let mut available_models: Vec<(u8, &str)> = Vec::new();

    if let Ok(anthropic) = AnthropicProvider::from_env() {
        info!("registered anthropic provider");
        providers.register("claude-", Arc::new(anthropic));
        available_models.extend([
            (1, "claude-3-5-haiku-20241022"),
            (2, "claude-3-5-sonnet-20241022"),
            (3, "claude-3-5-sonnet-20241022"),
            (4, "claude-3-opus-20240229"),
        ]);
    } else {
        info!("anthropic provider unavailable (ANTHROPIC_API_KEY not set)");
    }

    if let Ok(openai) = OpenAIProvider::from_env() {
        info!("registered openai provider");
        providers.register("gpt-", Arc::new(openai));
        available_models.extend([(1, "gpt-4o-mini"), (2, "gpt-4o"), (3, "gpt-4o"), (4, "gpt-4o")]);
    } else {
        info!("openai provider unavailable (OPENAI_API_KEY not set)");
    }

    if available_models.is_empty() {
        anyhow::bail!("no LLM providers available; set ANTHROPIC_API_KEY or OPENAI_API_KEY");
    }

    let router = SmartRouter::new();
    let mut by_tier: BTreeMap<u8, Vec<String>> = BTreeMap::new();
    for (tier, model) in available_models {
        by_tier.entry(tier).or_default().push(model.to_string());
    }
    for (tier, models) in by_tier {
        router.register_chain(ModelTier(tier), FallbackChain::new(models));
    }

    Ok((Arc::new(router), Arc::new(providers)))
}

fn parse_input(input_str: &str) -> Result<BTreeMap<String, Value>> {
    let raw = if Path::new(input_str).exists() {
        fs::read_to_string(input_str).with_context(|| format!("failed to read input file: {input_str}"))?
    } else {
        input_str.to_string()
    };
    let json: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| "failed to parse input as JSON")?;
    match Value::from(json) {
        Value::Map(map) => Ok(map),
        other => {
            let mut map = BTreeMap::new();
            map.insert("input".to_string(), other);
            Ok(map)
        }
    }
}

async fn run_workflow(
    file_path: &str,
    input: Option<&str>,
    max_concurrency: usize,
    timeout_secs: Option<u64>,
    runs_dir: Option<&str>,
) -> Result<()> {
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);
    let definition =
        load_file(Path::new(file_path)).with_context(|| format!("failed to load workflow: {file_path}"))?;

    let inputs = match input {
        Some(s) => parse_input(s)?,
        None => BTreeMap::new(),
    };

    let (router, providers) = build_router_and_providers()?;
    let tools = Arc::new(ToolRegistry::new());
    let rate_limiter = Arc::new(RateLimitTracker::new());

    let mut executor = WorkflowExecutor::new(router, providers, tools)
        .with_max_concurrency(max_concurrency)
        .with_rate_limiter(rate_limiter);
    if let Some(secs) = timeout_secs {
        executor = executor.with_global_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = runs_dir {
        let logger = workflow_engine_core::RunLogger::new(dir).with_context(|| format!("failed to open runs dir: {dir}"))?;
        executor = executor.with_run_logger(Arc::new(logger));
    }

    println!("{}", "Executing workflow...".cyan());
    let result = executor
        .run(&definition, inputs, vec![Arc::new(LoggingEventHandler)])
        .await
        .with_context(|| "workflow execution failed")?;

    let failed = result.overall_status != workflow_engine_core::StepStatus::Success;
    if failed {
        println!("{}", "\u{2717} Workflow completed with failures".red().bold());
    } else {
        println!("{}", "\u{2713} Workflow completed successfully".green().bold());
    }
    println!("\n{}", "Result:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_else(|_| format!("{result:?}")));

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level workflow orchestration: wires the service container,
//! drives a [`DagExecutor`] run under an optional global timeout, and
//! emits workflow-level lifecycle events around it.

use crate::context::{ContextEvent, EventHandler, ExecutionContext};
use crate::dag::DAG;
use crate::dag_executor::DagExecutor;
use crate::error::Result;
use crate::providers::ProviderRegistry;
use crate::rate_limit::RateLimitTracker;
use crate::router::SmartRouter;
use crate::run_logger::{RunLogger, RunRecordOptions};
use crate::step::StepDefinition;
use crate::tool::ToolRegistry;
use crate::value::Value;
use crate::workflow_def::WorkflowDefinition;
use crate::workflow_result::{StepStatus, WorkflowResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Chains a flat, ordered list of steps into a one-wide DAG by defaulting
/// each step's `depends_on` onto its predecessor when it declares none of
/// its own — a bare list of steps expressed as a DAG.
pub fn linear_dag(name: &str, steps: Vec<StepDefinition>) -> DAG {
    let mut dag = DAG::new(name);
    let mut previous: Option<String> = None;
    for mut step in steps {
        if step.depends_on.is_empty() {
            if let Some(prev) = &previous {
                step.depends_on.push(prev.clone());
            }
        }
        previous = Some(step.name.clone());
        if let Err(e) = dag.add(step) {
            warn!(error = %e, "linear_dag: dropping duplicate step");
        }
    }
    dag
}

/// Drives a workflow (YAML-parsed definition or a raw [`DAG`]) end to end:
/// builds the [`ExecutionContext`], registers the shared services every
/// LLM step needs, runs the DAG under a global deadline, and persists the
/// resulting [`WorkflowResult`] if a [`RunLogger`] is configured.
pub struct WorkflowExecutor {
    router: Arc<SmartRouter>,
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    rate_limiter: Option<Arc<RateLimitTracker>>,
    run_logger: Option<Arc<RunLogger>>,
    max_concurrency: usize,
    global_timeout: Option<Duration>,
}

impl WorkflowExecutor {
    pub fn new(router: Arc<SmartRouter>, providers: Arc<ProviderRegistry>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            router,
            providers,
            tools,
            rate_limiter: None,
            run_logger: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            global_timeout: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimitTracker>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_run_logger(mut self, logger: Arc<RunLogger>) -> Self {
        self.run_logger = Some(logger);
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    fn new_context(&self, workflow_id: &str, inputs: BTreeMap<String, Value>) -> Arc<ExecutionContext> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let ctx = ExecutionContext::new(workflow_id, run_id).with_inputs(inputs);
        ctx.services.register(self.router.clone());
        ctx.services.register(self.providers.clone());
        ctx.services.register(self.tools.clone());
        if let Some(limiter) = &self.rate_limiter {
            ctx.services.register(limiter.clone());
        }
        Arc::new(ctx)
    }

    /// Runs a parsed workflow definition's DAG to completion.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<WorkflowResult> {
        self.run_dag(&definition.name, &definition.dag, inputs, handlers).await
    }

    /// Runs a raw DAG, independent of any YAML definition. The entry point
    /// for programmatically assembled workflows, including a legacy flat
    /// step list turned into a DAG via [`linear_dag`].
    ///
    /// Builds a fresh [`ExecutionContext`] with no way for the caller to
    /// reach it afterwards; use [`WorkflowExecutor::run_dag_with_context`]
    /// directly when the caller needs to retain an `Arc<ExecutionContext>`
    /// to call [`ExecutionContext::cancel`] from another task while the run
    /// is in flight.
    pub async fn run_dag(
        &self,
        workflow_name: &str,
        dag: &DAG,
        inputs: BTreeMap<String, Value>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<WorkflowResult> {
        let ctx = self.new_context(workflow_name, inputs.clone());
        self.run_dag_with_context(workflow_name, dag, ctx, inputs, handlers).await
    }

    /// Builds the [`ExecutionContext`] a [`WorkflowExecutor`] would build
    /// internally, without running anything — callers that need to cancel
    /// a run from another task should hold onto this `Arc` and pass it to
    /// [`WorkflowExecutor::run_dag_with_context`].
    pub fn build_context(&self, workflow_name: &str, inputs: BTreeMap<String, Value>) -> Arc<ExecutionContext> {
        self.new_context(workflow_name, inputs)
    }

    /// Same as [`WorkflowExecutor::run_dag`] but against a caller-supplied
    /// context, so the caller can retain the `Arc` and call
    /// [`ExecutionContext::cancel`] concurrently from another task.
    pub async fn run_dag_with_context(
        &self,
        workflow_name: &str,
        dag: &DAG,
        ctx: Arc<ExecutionContext>,
        inputs: BTreeMap<String, Value>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<WorkflowResult> {
        for handler in &handlers {
            ctx.on(handler.clone());
        }

        ctx.emit(ContextEvent::WorkflowStart {
            workflow_name: workflow_name.to_string(),
        })
        .await;

        let executor = DagExecutor::new();
        let run_future = executor.execute(dag, &ctx, self.max_concurrency);

        let mut result = match self.global_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run_future).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(
                        workflow = workflow_name,
                        timeout_secs = timeout.as_secs(),
                        "workflow exceeded global timeout"
                    );
                    ctx.cancel();
                    ctx.emit(ContextEvent::Cancelled {
                        reason: "global timeout exceeded".to_string(),
                    })
                    .await;
                    let mut result = WorkflowResult::new(ctx.run_id(), workflow_name);
                    result.overall_status = StepStatus::Failed;
                    result.final_output = ctx.all_variables().await;
                    result.end_time = Some(chrono::Utc::now());
                    result
                        .metadata
                        .insert("error_kind".to_string(), Value::String("timeout".to_string()));
                    result.metadata.insert(
                        "error".to_string(),
                        Value::String(format!(
                            "workflow exceeded global timeout of {}s",
                            timeout.as_secs()
                        )),
                    );
                    result
                }
            },
            None => run_future.await?,
        };

        let status_str = match result.overall_status {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            _ => "unknown",
        };
        ctx.emit(ContextEvent::WorkflowEnd {
            workflow_name: workflow_name.to_string(),
            status: status_str.to_string(),
        })
        .await;

        if let Some(logger) = &self.run_logger {
            let options = RunRecordOptions {
                workflow_inputs: Some(inputs),
                ..Default::default()
            };
            if let Err(e) = logger.log(&result, &options) {
                error!(error = %e, "failed to persist run log");
            }
        }

        result
            .metadata
            .entry("workflow_name".to_string())
            .or_insert_with(|| Value::String(workflow_name.to_string()));
        info!(
            workflow = workflow_name,
            run_id = ctx.run_id(),
            status = status_str,
            "workflow run complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDefinition, StepFunction};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl StepFunction for Echo {
        async fn call(
            &self,
            inputs: &BTreeMap<String, Value>,
            _ctx: &Arc<ExecutionContext>,
        ) -> Result<BTreeMap<String, Value>> {
            Ok(inputs.clone())
        }
    }

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(
            Arc::new(SmartRouter::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(ToolRegistry::default()),
        )
    }

    #[tokio::test]
    async fn runs_a_single_step_dag_to_success() {
        let mut dag = DAG::new("wf");
        dag.add(StepDefinition::new("a").with_func(Arc::new(Echo))).unwrap();
        let result = executor().run_dag("wf", &dag, BTreeMap::new(), Vec::new()).await.unwrap();
        assert_eq!(result.overall_status, StepStatus::Success);
    }

    #[tokio::test]
    async fn global_timeout_marks_result_failed_with_timeout_kind() {
        struct Sleeper;
        #[async_trait]
        impl StepFunction for Sleeper {
            async fn call(
                &self,
                _inputs: &BTreeMap<String, Value>,
                _ctx: &Arc<ExecutionContext>,
            ) -> Result<BTreeMap<String, Value>> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(BTreeMap::new())
            }
        }
        let mut dag = DAG::new("wf");
        dag.add(StepDefinition::new("a").with_func(Arc::new(Sleeper))).unwrap();
        let exec = executor().with_global_timeout(Duration::from_millis(20));
        let result = exec.run_dag("wf", &dag, BTreeMap::new(), Vec::new()).await.unwrap();
        assert_eq!(result.overall_status, StepStatus::Failed);
        assert_eq!(
            result.metadata.get("error_kind").and_then(|v| v.as_str()),
            Some("timeout")
        );
    }

    #[tokio::test]
    async fn cancelling_the_context_fails_an_in_flight_step_as_cancelled() {
        struct Sleeper;
        #[async_trait]
        impl StepFunction for Sleeper {
            async fn call(
                &self,
                _inputs: &BTreeMap<String, Value>,
                _ctx: &Arc<ExecutionContext>,
            ) -> Result<BTreeMap<String, Value>> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(BTreeMap::new())
            }
        }
        let mut dag = DAG::new("wf");
        dag.add(StepDefinition::new("a").with_func(Arc::new(Sleeper))).unwrap();
        let exec = executor();
        let ctx = exec.build_context("wf", BTreeMap::new());
        let cancel_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_ctx.cancel();
        });
        let result = exec
            .run_dag_with_context("wf", &dag, ctx, BTreeMap::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(result.overall_status, StepStatus::Failed);
        let a = result.steps.iter().find(|s| s.step_name == "a").unwrap();
        assert_eq!(a.status, StepStatus::Failed);
        assert_eq!(a.error_kind.as_deref(), Some("CancelledError"));
    }

    #[tokio::test]
    async fn linear_dag_chains_steps_in_order() {
        let steps = vec![
            StepDefinition::new("a").with_func(Arc::new(Echo)),
            StepDefinition::new("b").with_func(Arc::new(Echo)),
        ];
        let dag = linear_dag("wf", steps);
        assert_eq!(dag.steps["b"].depends_on, vec!["a".to_string()]);
    }
}

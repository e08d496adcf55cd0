// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent DAG execution: ready-set scheduling over a
//! [`tokio::task::JoinSet`], cascade-skip on failure, deterministic FIFO
//! ordering among equally-ready steps.

use crate::context::ExecutionContext;
use crate::dag::DAG;
use crate::error::{OrchestratorError, Result};
use crate::step::StepExecutor;
use crate::step_state::{StepState, StepStateManager};
use crate::workflow_result::{StepResult, StepStatus, WorkflowResult};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Invoked after each step result is recorded, for progress reporting.
pub type UpdateListener = Arc<dyn Fn(&StepResult) + Send + Sync>;

pub struct DagExecutor {
    listeners: Vec<UpdateListener>,
}

impl Default for DagExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DagExecutor {
    pub fn new() -> Self {
        Self { listeners: Vec::new() }
    }

    pub fn on_update(mut self, listener: UpdateListener) -> Self {
        self.listeners.push(listener);
        self
    }

    fn notify(&self, result: &StepResult) {
        for listener in &self.listeners {
            listener(result);
        }
    }

    /// Executes every step in `dag` against `ctx`, bounding in-flight
    /// steps to `max_concurrency`. Ready steps are launched in FIFO name
    /// order; a failed step cascade-skips its transitive dependents via
    /// BFS while an unreached, unrelated branch keeps running.
    pub async fn execute(
        &self,
        dag: &DAG,
        ctx: &Arc<ExecutionContext>,
        max_concurrency: usize,
    ) -> Result<WorkflowResult> {
        dag.validate(true)?;

        let mut result = WorkflowResult::new(ctx.run_id(), &dag.name);
        if dag.steps.is_empty() {
            result.overall_status = StepStatus::Success;
            result.end_time = Some(chrono::Utc::now());
            return Ok(result);
        }

        let mut states = StepStateManager::default();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<StepResult> = JoinSet::new();
        let max_concurrency = max_concurrency.max(1);

        loop {
            let finished: HashSet<String> =
                completed.iter().chain(failed.iter()).chain(skipped.iter()).cloned().collect();

            let mut ready: VecDeque<String> = dag
                .get_ready_steps(&finished)
                .into_iter()
                .filter(|name| !scheduled.contains(name))
                .collect();

            if !ctx.is_cancelled() {
                while join_set.len() < max_concurrency {
                    let Some(name) = ready.pop_front() else { break };
                    scheduled.insert(name.clone());
                    let step = dag.steps.get(&name).cloned().ok_or_else(|| {
                        OrchestratorError::StepNotFound(name.clone())
                    })?;
                    let ctx = ctx.clone();
                    join_set.spawn(async move {
                        let mut local_states = StepStateManager::default();
                        StepExecutor::execute(&step, &ctx, &mut local_states).await
                    });
                }
            }

            if join_set.is_empty() {
                if scheduled.len() < dag.steps.len() {
                    // Either no step can make progress (every remaining step
                    // blocked on a dependency that will never complete), or
                    // the run was cancelled before these steps ever started.
                    let reason = if ctx.is_cancelled() { "cancelled" } else { "unmet dependencies" };
                    let remaining: Vec<String> = dag
                        .steps
                        .keys()
                        .filter(|n| !scheduled.contains(*n))
                        .cloned()
                        .collect();
                    for name in &remaining {
                        skipped.insert(name.clone());
                        states.set_state(name, StepState::Skipped);
                        let mut r = StepResult::new(name);
                        r.status = StepStatus::Skipped;
                        r.metadata.insert(
                            "skip_reason".to_string(),
                            crate::value::Value::String(reason.to_string()),
                        );
                        r.end_time = Some(chrono::Utc::now());
                        self.notify(&r);
                        result.steps.push(r);
                    }
                }
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let step_result = joined.map_err(|e| OrchestratorError::Other(e.to_string()))?;
            states.set_state(&step_result.step_name, match step_result.status {
                StepStatus::Success => StepState::Success,
                StepStatus::Failed => StepState::Failed,
                StepStatus::Skipped => StepState::Skipped,
                _ => StepState::Running,
            });

            match step_result.status {
                StepStatus::Success => {
                    completed.insert(step_result.step_name.clone());
                }
                StepStatus::Failed => {
                    failed.insert(step_result.step_name.clone());
                    warn!(step = %step_result.step_name, "step failed, cascading skip to dependents");
                    self.cascade_skip(dag, &step_result.step_name, &mut skipped, &mut scheduled, &mut result, &completed, &failed);
                }
                StepStatus::Skipped => {
                    skipped.insert(step_result.step_name.clone());
                }
                _ => {}
            }

            self.notify(&step_result);
            result.steps.push(step_result);
        }

        result.overall_status = if failed.is_empty() {
            StepStatus::Success
        } else {
            StepStatus::Failed
        };
        result.final_output = ctx.all_variables().await;
        result.end_time = Some(chrono::Utc::now());
        info!(
            workflow = %dag.name,
            success = failed.is_empty(),
            steps = result.steps.len(),
            "dag execution finished"
        );
        Ok(result)
    }

    /// BFS over transitive dependents of a failed step, marking each as
    /// skipped so it is never scheduled.
    #[allow(clippy::too_many_arguments)]
    fn cascade_skip(
        &self,
        dag: &DAG,
        failed_step: &str,
        skipped: &mut HashSet<String>,
        scheduled: &mut HashSet<String>,
        result: &mut WorkflowResult,
        completed: &HashSet<String>,
        failed: &HashSet<String>,
    ) {
        let mut queue: VecDeque<String> = dag.get_dependents(failed_step).into();
        while let Some(name) = queue.pop_front() {
            if skipped.contains(&name) || completed.contains(&name) || failed.contains(&name) {
                continue;
            }
            skipped.insert(name.clone());
            scheduled.insert(name.clone());
            let mut r = StepResult::new(&name);
            r.status = StepStatus::Skipped;
            r.metadata.insert(
                "skip_reason".to_string(),
                crate::value::Value::String("dependency failed".to_string()),
            );
            r.end_time = Some(chrono::Utc::now());
            self.notify(&r);
            result.steps.push(r);
            for dependent in dag.get_dependents(&name) {
                queue.push_back(dependent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDefinition, StepFunction};
    use crate::value::Value;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct Always<const OK: bool>;

    #[async_trait]
    impl<const OK: bool> StepFunction for Always<OK> {
        async fn call(
            &self,
            _inputs: &BTreeMap<String, Value>,
            _ctx: &Arc<ExecutionContext>,
        ) -> Result<BTreeMap<String, Value>> {
            if OK {
                Ok(BTreeMap::new())
            } else {
                Err(OrchestratorError::Other("boom".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn cascade_skips_dependents_of_failed_step() {
        let mut dag = DAG::new("wf");
        dag.add(StepDefinition::new("a").with_func(Arc::new(Always::<false>))).unwrap();
        dag.add(
            StepDefinition::new("b")
                .with_depends_on(vec!["a".to_string()])
                .with_func(Arc::new(Always::<true>)),
        )
        .unwrap();
        dag.add(StepDefinition::new("c").with_func(Arc::new(Always::<true>))).unwrap();

        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let executor = DagExecutor::new();
        let result = executor.execute(&dag, &ctx, 4).await.unwrap();

        assert_eq!(result.overall_status, StepStatus::Failed);
        let b = result.steps.iter().find(|s| s.step_name == "b").unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        let c = result.steps.iter().find(|s| s.step_name == "c").unwrap();
        assert_eq!(c.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn empty_dag_succeeds() {
        let dag = DAG::new("wf");
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let executor = DagExecutor::new();
        let result = executor.execute(&dag, &ctx, 4).await.unwrap();
        assert_eq!(result.overall_status, StepStatus::Success);
    }

    #[tokio::test]
    async fn all_steps_succeed_when_independent() {
        let mut dag = DAG::new("wf");
        for name in ["a", "b", "c"] {
            dag.add(StepDefinition::new(name).with_func(Arc::new(Always::<true>))).unwrap();
        }
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let executor = DagExecutor::new();
        let result = executor.execute(&dag, &ctx, 2).await.unwrap();
        assert_eq!(result.overall_status, StepStatus::Success);
        assert_eq!(result.steps.len(), 3);
    }
}

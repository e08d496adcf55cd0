// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step definitions and the per-step execution pipeline.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::expr::{evaluate, evaluate_bool};
use crate::retry::RetryConfig;
use crate::step_state::StepState;
use crate::value::Value;
use crate::workflow_result::{StepResult, StepStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A step's behavior: maps resolved inputs to outputs against a live
/// execution context. LLM-backed steps, tool steps, and deterministic
/// tier-0 steps are all just implementations of this.
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn call(
        &self,
        inputs: &BTreeMap<String, Value>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<BTreeMap<String, Value>>;
}

type BoxedFn = Arc<
    dyn Fn(
            BTreeMap<String, Value>,
            Arc<ExecutionContext>,
        ) -> Pin<Box<dyn Future<Output = Result<BTreeMap<String, Value>>> + Send>>
        + Send
        + Sync,
>;

/// Adapts a plain async closure into a [`StepFunction`].
pub struct FnStep(pub BoxedFn);

#[async_trait]
impl StepFunction for FnStep {
    async fn call(
        &self,
        inputs: &BTreeMap<String, Value>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<BTreeMap<String, Value>> {
        (self.0)(inputs.clone(), ctx.clone()).await
    }
}

/// A side-effecting callback run around a step's execution: `pre_hooks` gate
/// entry, `post_hooks` run after a successful attempt, `error_hooks` run
/// after a terminal failure. See [`StepExecutor::execute`] for how each
/// kind's errors are handled.
#[async_trait]
pub trait StepHook: Send + Sync {
    async fn call(&self, ctx: &Arc<ExecutionContext>) -> Result<()>;
}

type BoxedHookFn = Arc<
    dyn Fn(Arc<ExecutionContext>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Adapts a plain async closure into a [`StepHook`].
pub struct FnHook(pub BoxedHookFn);

#[async_trait]
impl StepHook for FnHook {
    async fn call(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Static declaration of a step: dependencies, gating expressions, I/O
/// mapping, retry policy, and the function resolved to run it.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub description: String,
    pub depends_on: Vec<String>,
    /// `${...}` expression; step is skipped (completed, not cascade-skip)
    /// when this evaluates falsy.
    pub when: Option<String>,
    pub unless: Option<String>,
    /// dest field -> source `${...}` expression, evaluated against ctx.
    pub input_mapping: BTreeMap<String, String>,
    /// step output field (as produced by `func`) -> destination ctx path,
    /// matching the YAML `outputs: { <step_output_key>: context_path }`
    /// shape.
    pub output_mapping: BTreeMap<String, String>,
    /// Re-run while this expression evaluates truthy, up to `loop_max`.
    pub loop_until: Option<String>,
    pub loop_max: u32,
    pub retry: RetryConfig,
    pub timeout: Option<Duration>,
    pub metadata: BTreeMap<String, Value>,
    pub func: Option<Arc<dyn StepFunction>>,
    /// Run in order before input mapping; any failure fails the step.
    pub pre_hooks: Vec<Arc<dyn StepHook>>,
    /// Run once after a successful attempt; a failure here propagates as
    /// the step's own failure (it is not retried).
    pub post_hooks: Vec<Arc<dyn StepHook>>,
    /// Run after a terminal failure; their own errors are logged and
    /// swallowed rather than overriding the step's failure.
    pub error_hooks: Vec<Arc<dyn StepHook>>,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("when", &self.when)
            .field("loop_until", &self.loop_until)
            .field("has_func", &self.func.is_some())
            .finish()
    }
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            when: None,
            unless: None,
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            loop_until: None,
            loop_max: 3,
            retry: RetryConfig::default(),
            timeout: None,
            metadata: BTreeMap::new(),
            func: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            error_hooks: Vec::new(),
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_func(mut self, func: Arc<dyn StepFunction>) -> Self {
        self.func = Some(func);
        self
    }

    pub fn with_pre_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.pre_hooks.push(hook);
        self
    }

    pub fn with_post_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.post_hooks.push(hook);
        self
    }

    pub fn with_error_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.error_hooks.push(hook);
        self
    }
}

/// Drives one [`StepDefinition`] through its full lifecycle: gating,
/// input resolution, retried/timed-out execution, output capture, and
/// looped re-runs.
pub struct StepExecutor;

impl StepExecutor {
    /// Resolves `step.when`/`step.unless` against `ctx`. A missing/falsy
    /// `when` or a truthy `unless` means "skip, but this is a completed
    /// state, not a cascade failure".
    pub async fn should_run(step: &StepDefinition, ctx: &ExecutionContext) -> Result<bool> {
        if let Some(when) = &step.when {
            if !evaluate_bool(when, ctx).await? {
                return Ok(false);
            }
        }
        if let Some(unless) = &step.unless {
            if evaluate_bool(unless, ctx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn resolve_inputs(
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<String, Value>> {
        let mut inputs = BTreeMap::new();
        for (dest, expr) in &step.input_mapping {
            let value = evaluate(expr, ctx).await?;
            inputs.insert(dest.clone(), value);
        }
        Ok(inputs)
    }

    fn apply_output_mapping(
        step: &StepDefinition,
        output: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        if step.output_mapping.is_empty() {
            return output.clone();
        }
        let mut mapped = BTreeMap::new();
        for (source_field, dest_path) in &step.output_mapping {
            if let Some(value) = output.get(source_field) {
                mapped.insert(dest_path.clone(), value.clone());
            }
        }
        mapped
    }

    /// Pulls the reserved `_meta` key (model/tokens/tool-call bookkeeping
    /// an LLM-backed step attaches to its own output) off the output map
    /// and onto the step result proper.
    fn extract_meta(output: &mut BTreeMap<String, Value>, result: &mut StepResult) {
        if let Some(Value::Map(meta)) = output.remove("_meta") {
            if let Some(model) = meta.get("model_used").and_then(|v| v.as_str()) {
                result.model_used = Some(model.to_string());
            }
            for (k, v) in meta {
                result.metadata.insert(k, v);
            }
        }
    }

    /// Runs `step` to completion: gating, retried/timed-out call, output
    /// mapping, `steps.<name>` side channel, and (if configured) repeated
    /// re-runs governed by `loop_until`/`loop_max`.
    pub async fn execute(
        step: &StepDefinition,
        ctx: &Arc<ExecutionContext>,
        states: &mut crate::step_state::StepStateManager,
    ) -> StepResult {
        let mut result = StepResult::new(&step.name);

        match Self::should_run(step, ctx).await {
            Ok(false) => {
                states.set_state(&step.name, StepState::Skipped);
                result.status = StepStatus::Skipped;
                result
                    .metadata
                    .insert("skip_reason".to_string(), Value::String("when/unless gate".to_string()));
                result.end_time = Some(chrono::Utc::now());
                return result;
            }
            Err(e) => {
                states.set_state(&step.name, StepState::Failed);
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                result.error_kind = Some(e.kind().to_string());
                result.end_time = Some(chrono::Utc::now());
                return result;
            }
            Ok(true) => {}
        }

        states.set_state(&step.name, StepState::Running);
        ctx.emit(crate::context::ContextEvent::StepStart {
            step_name: step.name.clone(),
        })
        .await;

        for hook in &step.pre_hooks {
            if let Err(e) = hook.call(ctx).await {
                states.set_state(&step.name, StepState::Failed);
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                result.error_kind = Some(e.kind().to_string());
                ctx.emit(crate::context::ContextEvent::StepError {
                    step_name: step.name.clone(),
                    error: e.to_string(),
                })
                .await;
                result.end_time = Some(chrono::Utc::now());
                return result;
            }
        }

        let mut loop_count: u32 = 0;
        let mut total_retries: u32 = 0;
        let mut last_output: BTreeMap<String, Value> = BTreeMap::new();
        let mut last_error: Option<OrchestratorError> = None;

        loop {
            let inputs = match Self::resolve_inputs(step, ctx).await {
                Ok(inputs) => inputs,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            result.input_data = inputs.clone();

            match Self::run_with_retry(step, &inputs, ctx).await {
                Ok((mut output, retries)) => {
                    Self::extract_meta(&mut output, &mut result);
                    last_output = output;
                    last_error = None;
                    total_retries += retries;
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }

            loop_count += 1;
            result
                .metadata
                .insert("loop_iteration".to_string(), Value::Number(loop_count as f64));
            let should_loop = match &step.loop_until {
                Some(expr) if loop_count < step.loop_max => {
                    let child = ctx.child();
                    for (k, v) in &last_output {
                        let _ = child.set(k, v.clone()).await;
                    }
                    !evaluate_bool(expr, &child).await.unwrap_or(true)
                }
                _ => false,
            };
            if !should_loop {
                break;
            }
        }

        match last_error {
            Some(e) => {
                states.set_state(&step.name, StepState::Failed);
                result.status = StepStatus::Failed;
                result.retry_count = total_retries;
                result.error = Some(e.to_string());
                result.error_kind = Some(e.kind().to_string());
                ctx.emit(crate::context::ContextEvent::StepError {
                    step_name: step.name.clone(),
                    error: e.to_string(),
                })
                .await;
                for hook in &step.error_hooks {
                    if let Err(hook_err) = hook.call(ctx).await {
                        warn!(step = %step.name, error = %hook_err, "error hook failed, swallowing");
                    }
                }
                warn!(step = %step.name, error = %e, "step failed");
            }
            None => {
                states.set_state(&step.name, StepState::Success);
                result.status = StepStatus::Success;
                result.retry_count = total_retries;
                let mapped = Self::apply_output_mapping(step, &last_output);
                for (k, v) in &mapped {
                    let _ = ctx.set(k, v.clone()).await;
                }
                let mut steps_view = BTreeMap::new();
                steps_view.insert("status".to_string(), Value::String(result.status.to_string()));
                steps_view.insert("outputs".to_string(), Value::Map(last_output.clone()));
                let _ = ctx
                    .set(&format!("steps.{}", step.name), Value::Map(steps_view))
                    .await;
                result.output_data = last_output;
                ctx.mark_completed(&step.name).await;
                info!(step = %step.name, "step completed");
            }
        }

        ctx.emit(crate::context::ContextEvent::StepEnd {
            step_name: step.name.clone(),
        })
        .await;
        result.end_time = Some(chrono::Utc::now());
        result
    }

    /// Returns the step's output together with the number of re-attempts
    /// actually taken: re-attempts, not total attempts, so a step that
    /// succeeds on its first try reports 0.
    async fn run_with_retry(
        step: &StepDefinition,
        inputs: &BTreeMap<String, Value>,
        ctx: &Arc<ExecutionContext>,
    ) -> Result<(BTreeMap<String, Value>, u32)> {
        let func = step
            .func
            .as_ref()
            .ok_or_else(|| OrchestratorError::NoStepFunction(step.name.clone()))?;

        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(OrchestratorError::Cancelled {
                    step_name: step.name.clone(),
                });
            }
            let call = func.call(inputs, ctx);
            let cancelled = ctx.cancelled();
            tokio::pin!(cancelled);
            let outcome = match step.timeout {
                Some(d) => {
                    tokio::select! {
                        r = tokio::time::timeout(d, call) => match r {
                            Ok(inner) => inner,
                            Err(_) => Err(OrchestratorError::Timeout {
                                step_name: step.name.clone(),
                                duration: d,
                            }),
                        },
                        _ = &mut cancelled => Err(OrchestratorError::Cancelled {
                            step_name: step.name.clone(),
                        }),
                    }
                }
                None => {
                    tokio::select! {
                        r = call => r,
                        _ = &mut cancelled => Err(OrchestratorError::Cancelled {
                            step_name: step.name.clone(),
                        }),
                    }
                }
            };

            match outcome {
                Ok(output) => {
                    for hook in &step.post_hooks {
                        hook.call(ctx).await?;
                    }
                    return Ok((output, attempt));
                }
                Err(e) => {
                    let kind = e.kind();
                    let never_retry = matches!(
                        kind,
                        crate::error::ErrorKind::TimeoutError | crate::error::ErrorKind::CancelledError
                    );
                    if !never_retry && attempt < step.retry.max_retries && step.retry.should_retry(&kind) {
                        let delay = step.retry.jittered_delay(attempt + 1);
                        debug!(step = %step.name, attempt, delay_ms = delay.as_millis() as u64, "retrying step");
                        ctx.mark_failed(&step.name).await;
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;

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

    #[tokio::test]
    async fn skipped_step_marks_skipped_state_not_failure() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let mut step = StepDefinition::new("a").with_func(Arc::new(Echo));
        step.when = Some("${false}".to_string());
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(states.get_state("a"), StepState::Skipped);
    }

    #[tokio::test]
    async fn successful_step_sets_steps_namespace_status_and_outputs() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let mut step = StepDefinition::new("a").with_func(Arc::new(Echo));
        step.input_mapping.insert("x".to_string(), "${1}".to_string());
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Success);

        // Downstream expressions read `${steps.<name>.outputs.<key>}`, not a
        // flat `steps.<name>.<key>` map.
        let outputs_x = crate::expr::evaluate("${steps.a.outputs.x}", &ctx).await.unwrap();
        assert_eq!(outputs_x, Value::Number(1.0));

        let status = crate::expr::evaluate("${steps.a.status}", &ctx).await.unwrap();
        assert_eq!(status, Value::String("success".to_string()));

        // The bare flat-map path from before the fix must not resolve.
        let flat = ctx.get("steps.a.x").await;
        assert!(flat.is_none());
    }

    #[tokio::test]
    async fn output_mapping_writes_named_field_to_dest_path() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let mut step = StepDefinition::new("a").with_func(Arc::new(Echo));
        step.input_mapping.insert("summary".to_string(), "${'hi'}".to_string());
        step.output_mapping.insert("summary".to_string(), "shared.summary".to_string());
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(
            ctx.get("shared.summary").await,
            Some(Value::String("hi".to_string()))
        );
    }

    #[tokio::test]
    async fn meta_key_is_lifted_onto_result_not_output() {
        struct WithMeta;
        #[async_trait]
        impl StepFunction for WithMeta {
            async fn call(
                &self,
                _inputs: &BTreeMap<String, Value>,
                _ctx: &Arc<ExecutionContext>,
            ) -> Result<BTreeMap<String, Value>> {
                let mut out = BTreeMap::new();
                out.insert("answer".to_string(), Value::String("42".to_string()));
                let mut meta = BTreeMap::new();
                meta.insert("model_used".to_string(), Value::String("tier1_writer".to_string()));
                out.insert("_meta".to_string(), Value::Map(meta));
                Ok(out)
            }
        }
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let step = StepDefinition::new("a").with_func(Arc::new(WithMeta));
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.model_used.as_deref(), Some("tier1_writer"));
        assert!(!result.output_data.contains_key("_meta"));
    }

    #[tokio::test]
    async fn missing_function_is_a_failure() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let step = StepDefinition::new("a");
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Failed);
    }

    struct FailNTimes {
        remaining: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl StepFunction for FailNTimes {
        async fn call(
            &self,
            _inputs: &BTreeMap<String, Value>,
            _ctx: &Arc<ExecutionContext>,
        ) -> Result<BTreeMap<String, Value>> {
            if self.remaining.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                self.remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Err(OrchestratorError::Other("transient failure".to_string()))
            } else {
                Ok(BTreeMap::new())
            }
        }
    }

    #[tokio::test]
    async fn retry_count_reflects_re_attempts_not_total_attempts() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let mut step = StepDefinition::new("a").with_func(Arc::new(FailNTimes {
            remaining: std::sync::atomic::AtomicU32::new(2),
        }));
        step.retry.base_delay_ms = 1;
        step.retry.max_delay_ms = 5;
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(result.retry_count, 2);
    }

    #[tokio::test]
    async fn pre_hook_failure_fails_step_before_func_runs() {
        struct BoomHook;
        #[async_trait]
        impl StepHook for BoomHook {
            async fn call(&self, _ctx: &Arc<ExecutionContext>) -> Result<()> {
                Err(OrchestratorError::other("pre-hook exploded"))
            }
        }
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let step = StepDefinition::new("a")
            .with_func(Arc::new(Echo))
            .with_pre_hook(Arc::new(BoomHook));
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("pre-hook exploded"));
    }

    #[tokio::test]
    async fn error_hook_runs_on_failure_but_its_own_error_is_swallowed() {
        struct AlwaysFails;
        #[async_trait]
        impl StepFunction for AlwaysFails {
            async fn call(
                &self,
                _inputs: &BTreeMap<String, Value>,
                _ctx: &Arc<ExecutionContext>,
            ) -> Result<BTreeMap<String, Value>> {
                Err(OrchestratorError::Validation("bad input".to_string()))
            }
        }
        struct BoomHook;
        #[async_trait]
        impl StepHook for BoomHook {
            async fn call(&self, _ctx: &Arc<ExecutionContext>) -> Result<()> {
                Err(OrchestratorError::other("error-hook exploded"))
            }
        }
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let step = StepDefinition::new("a")
            .with_func(Arc::new(AlwaysFails))
            .with_error_hook(Arc::new(BoomHook));
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn post_hook_failure_fails_step_without_retry() {
        struct BoomHook;
        #[async_trait]
        impl StepHook for BoomHook {
            async fn call(&self, _ctx: &Arc<ExecutionContext>) -> Result<()> {
                Err(OrchestratorError::other("post-hook exploded"))
            }
        }
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let step = StepDefinition::new("a")
            .with_func(Arc::new(Echo))
            .with_post_hook(Arc::new(BoomHook));
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn loop_until_tracks_iteration_count_in_metadata() {
        let ctx = Arc::new(ExecutionContext::new("wf", "run1"));
        let mut states = crate::step_state::StepStateManager::default();
        let mut step = StepDefinition::new("review").with_func(Arc::new(Echo));
        step.input_mapping.insert("status".to_string(), "${'needs work'}".to_string());
        step.loop_until = Some("${status == 'approved'}".to_string());
        step.loop_max = 3;
        let result = StepExecutor::execute(&step, &ctx, &mut states).await;
        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(
            result.metadata.get("loop_iteration"),
            Some(&Value::Number(3.0))
        );
        assert_eq!(result.retry_count, 0);
    }
}

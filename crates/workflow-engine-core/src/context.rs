// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution Context: hierarchical variable store, event hooks,
//! service container, and optional checkpointing.

use crate::error::{OrchestratorError, Result};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// A cloneable cancel flag shared by a workflow's root context and every
/// child context it spawns, so cancelling the run cancels every in-flight
/// step's suspension points at once.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested; never returns
    /// otherwise. Intended as one arm of a `tokio::select!`.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Events fired by an `ExecutionContext`, propagated upward through parent
/// contexts.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    WorkflowStart { workflow_name: String },
    WorkflowEnd { workflow_name: String, status: String },
    StepStart { step_name: String },
    StepEnd { step_name: String },
    StepError { step_name: String, error: String },
    Cancelled { reason: String },
    VariableSet { path: String, value: Value },
    CheckpointSave { name: String },
    CheckpointRestore { name: String },
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ContextEvent);
}

/// A dependency-injection container keyed by type, supporting both eagerly
/// registered singletons and lazily constructed factories. The smart
/// router and tool registry are resolved through this rather than as
/// process statics.
#[derive(Default)]
pub struct ServiceContainer {
    singletons: parking_lot::RwLock<BTreeMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.singletons
            .write()
            .insert(TypeId::of::<T>(), value as Arc<dyn Any + Send + Sync>);
    }

    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.singletons
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|arc| arc.downcast::<T>().ok())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub workflow_id: String,
    pub run_id: String,
    pub variables: BTreeMap<String, Value>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

struct Inner {
    variables: BTreeMap<String, Value>,
    completed_steps: HashSet<String>,
    failed_steps: HashSet<String>,
    metadata: BTreeMap<String, Value>,
}

/// Hierarchical variable store. Child contexts read through to their parent
/// but write locally.
pub struct ExecutionContext {
    workflow_id: String,
    run_id: String,
    parent: Option<Arc<ExecutionContext>>,
    inner: Mutex<Inner>,
    handlers: parking_lot::RwLock<Vec<Arc<dyn EventHandler>>>,
    pub services: ServiceContainer,
    pub checkpoint_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            parent: None,
            inner: Mutex::new(Inner {
                variables: BTreeMap::new(),
                completed_steps: HashSet::new(),
                failed_steps: HashSet::new(),
                metadata: BTreeMap::new(),
            }),
            handlers: parking_lot::RwLock::new(Vec::new()),
            services: ServiceContainer::new(),
            checkpoint_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inner.get_mut().variables = inputs;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: PathBuf) -> Self {
        self.checkpoint_dir = Some(dir);
        self
    }

    /// Creates a child context that reads through to `self` but writes locally.
    pub fn child(self: &Arc<Self>) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            parent: Some(self.clone()),
            inner: Mutex::new(Inner {
                variables: BTreeMap::new(),
                completed_steps: HashSet::new(),
                failed_steps: HashSet::new(),
                metadata: BTreeMap::new(),
            }),
            handlers: parking_lot::RwLock::new(Vec::new()),
            services: ServiceContainer::new(),
            checkpoint_dir: self.checkpoint_dir.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Requests cancellation of this run. Every context derived from the
    /// same root (via [`ExecutionContext::child`]) observes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`ExecutionContext::cancel`] has been called; a
    /// natural `tokio::select!` arm at any suspension point.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn on(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Fires the event on local handlers then propagates upward through
    /// parent contexts. Handler errors are swallowed and logged, never
    /// propagated.
    pub async fn emit(&self, event: ContextEvent) {
        let handlers: Vec<_> = self.handlers.read().clone();
        for handler in handlers {
            handler.handle(&event).await;
        }
        if let Some(parent) = &self.parent {
            Box::pin(parent.emit(event)).await;
        }
    }

    /// Plain key or dotted/indexed path lookup (`a.b[0].c`), falling through
    /// to the parent context on miss.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let local = {
            let inner = self.inner.lock().await;
            lookup_path(&inner.variables, path)
        };
        if local.is_some() {
            return local;
        }
        if let Some(parent) = &self.parent {
            return Box::pin(parent.get(path)).await;
        }
        None
    }

    /// Writes are always local; on success the write happens-before any
    /// subsequent read by this context or its children.
    pub async fn set(&self, path: &str, value: Value) {
        {
            let mut inner = self.inner.lock().await;
            set_path(&mut inner.variables, path, value.clone());
        }
        self.emit(ContextEvent::VariableSet {
            path: path.to_string(),
            value,
        })
        .await;
    }

    pub async fn all_variables(&self) -> BTreeMap<String, Value> {
        let mut merged = if let Some(parent) = &self.parent {
            Box::pin(parent.all_variables()).await
        } else {
            BTreeMap::new()
        };
        let inner = self.inner.lock().await;
        for (k, v) in &inner.variables {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    pub async fn mark_completed(&self, step_name: &str) {
        self.inner
            .lock()
            .await
            .completed_steps
            .insert(step_name.to_string());
    }

    pub async fn mark_failed(&self, step_name: &str) {
        self.inner
            .lock()
            .await
            .failed_steps
            .insert(step_name.to_string());
    }

    pub async fn completed_steps(&self) -> HashSet<String> {
        self.inner.lock().await.completed_steps.clone()
    }

    pub async fn failed_steps(&self) -> HashSet<String> {
        self.inner.lock().await.failed_steps.clone()
    }

    /// Serializes `{workflow_id, run_id, variables, completed_steps,
    /// failed_steps, metadata, timestamp}` and writes it atomically (temp
    /// file then rename) under `checkpoint_dir/<name>.json`.
    pub async fn save_checkpoint(&self, name: Option<&str>) -> Result<PathBuf> {
        let dir = self
            .checkpoint_dir
            .clone()
            .ok_or_else(|| OrchestratorError::other("no checkpoint_dir configured"))?;
        let name = name.unwrap_or("checkpoint");
        let inner = self.inner.lock().await;
        let checkpoint = Checkpoint {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            variables: inner.variables.clone(),
            completed_steps: inner.completed_steps.iter().cloned().collect(),
            failed_steps: inner.failed_steps.iter().cloned().collect(),
            metadata: inner.metadata.clone(),
            timestamp: Utc::now(),
            version: "1.0".to_string(),
        };
        drop(inner);

        tokio::fs::create_dir_all(&dir).await?;
        let final_path = dir.join(format!("{}.json", name));
        let tmp_path = dir.join(format!("{}.json.tmp", name));
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        self.emit(ContextEvent::CheckpointSave {
            name: name.to_string(),
        })
        .await;
        Ok(final_path)
    }

    /// Loads a checkpoint and restores variables/step-sets in place.
    pub async fn restore_checkpoint(&self, path: &std::path::Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        {
            let mut inner = self.inner.lock().await;
            inner.variables = checkpoint.variables;
            inner.completed_steps = checkpoint.completed_steps.into_iter().collect();
            inner.failed_steps = checkpoint.failed_steps.into_iter().collect();
            inner.metadata = checkpoint.metadata;
        }
        self.emit(ContextEvent::CheckpointRestore {
            name: path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("checkpoint")
                .to_string(),
        })
        .await;
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

/// Logs handler errors rather than propagating them. Provided so callers
/// have a ready `EventHandler` that never panics the emit loop.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &ContextEvent) {
        match event {
            ContextEvent::StepError { step_name, error } => {
                warn!(step_name, error, "step error event");
            }
            _ => {
                tracing::debug!(?event, "context event");
            }
        }
    }
}

impl std::fmt::Debug for ContextEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextEvent::WorkflowStart { workflow_name } => {
                write!(f, "WorkflowStart({})", workflow_name)
            }
            ContextEvent::WorkflowEnd { workflow_name, status } => {
                write!(f, "WorkflowEnd({}, {})", workflow_name, status)
            }
            ContextEvent::StepStart { step_name } => {
                write!(f, "StepStart({})", step_name)
            }
            ContextEvent::StepEnd { step_name } => write!(f, "StepEnd({})", step_name),
            ContextEvent::StepError { step_name, .. } => {
                write!(f, "StepError({})", step_name)
            }
            ContextEvent::Cancelled { reason } => write!(f, "Cancelled({})", reason),
            ContextEvent::VariableSet { path, .. } => write!(f, "VariableSet({})", path),
            ContextEvent::CheckpointSave { name } => write!(f, "CheckpointSave({})", name),
            ContextEvent::CheckpointRestore { name } => {
                write!(f, "CheckpointRestore({})", name)
            }
        }
    }
}

/// Parses and resolves a dotted/bracket-indexed path against a variable map.
/// `a.b[0].c` -> lookup `a`, then key `b`, then index `0`, then key `c`.
pub fn lookup_path(root: &BTreeMap<String, Value>, path: &str) -> Option<Value> {
    let segments = parse_path(path);
    let (first, rest) = segments.split_first()?;
    let PathSegment::Key(first_key) = first else {
        return None;
    };
    let mut current = root.get(first_key)?;
    for segment in rest {
        current = match segment {
            PathSegment::Key(key) => current.get(key)?,
            PathSegment::Index(idx) => current.get_index(*idx)?,
        };
    }
    Some(current.clone())
}

fn set_path(root: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    let segments = parse_path(path);
    if segments.len() == 1 {
        if let PathSegment::Key(key) = &segments[0] {
            root.insert(key.clone(), value);
        }
        return;
    }
    let Some((PathSegment::Key(first_key), rest)) = segments.split_first().map(|(f, r)| (f, r))
    else {
        return;
    };
    let entry = root.entry(first_key.clone()).or_insert_with(Value::map);
    set_path_recursive(entry, rest, value);
}

fn set_path_recursive(current: &mut Value, segments: &[PathSegment], value: Value) {
    if segments.is_empty() {
        *current = value;
        return;
    }
    match &segments[0] {
        PathSegment::Key(key) => {
            if !matches!(current, Value::Map(_)) {
                *current = Value::map();
            }
            if let Value::Map(map) = current {
                let entry = map.entry(key.clone()).or_insert_with(Value::map);
                set_path_recursive(entry, &segments[1..], value);
            }
        }
        PathSegment::Index(idx) => {
            if !matches!(current, Value::List(_)) {
                *current = Value::List(Vec::new());
            }
            if let Value::List(list) = current {
                while list.len() <= *idx {
                    list.push(Value::Null);
                }
                set_path_recursive(&mut list[*idx], &segments[1..], value);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut idx_str = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    idx_str.push(c);
                }
                let trimmed = idx_str.trim_matches(|c| c == '"' || c == '\'');
                if let Ok(idx) = trimmed.parse::<usize>() {
                    segments.push(PathSegment::Index(idx));
                } else if !trimmed.is_empty() {
                    segments.push(PathSegment::Key(trimmed.to_string()));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn child_context_reads_through_parent_but_writes_locally() {
        let parent = Arc::new(ExecutionContext::new("wf", "run-1"));
        parent.set("a", Value::from("parent-value")).await;

        let child = parent.child();
        assert_eq!(child.get("a").await, Some(Value::from("parent-value")));

        child.set("a", Value::from("child-value")).await;
        assert_eq!(child.get("a").await, Some(Value::from("child-value")));
        assert_eq!(parent.get("a").await, Some(Value::from("parent-value")));
    }

    #[tokio::test]
    async fn path_lookup_supports_dotted_and_indexed_segments() {
        let ctx = ExecutionContext::new("wf", "run-1");
        ctx.set("a.b[0].c", Value::from("resolved")).await;
        assert_eq!(ctx.get("a.b[0].c").await, Some(Value::from("resolved")));
    }

    #[tokio::test]
    async fn checkpoint_round_trip_preserves_state() {
        let dir = std::env::temp_dir().join(format!("wf-ctx-test-{}", uuid::Uuid::new_v4()));
        let ctx = ExecutionContext::new("wf", "run-1").with_checkpoint_dir(dir.clone());
        ctx.set("x", Value::from(1.0)).await;
        ctx.mark_completed("step1").await;
        let path = ctx.save_checkpoint(Some("cp")).await.unwrap();

        let restored = ExecutionContext::new("wf", "run-1").with_checkpoint_dir(dir.clone());
        restored.restore_checkpoint(&path).await.unwrap();
        assert_eq!(restored.get("x").await, Some(Value::from(1.0)));
        assert!(restored.completed_steps().await.contains("step1"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

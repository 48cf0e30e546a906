//! Shared runtime state of one graph execution.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::types::{new_var_map, VarMap};
use crate::vars::VariablePool;

/// State shared between the engine, its workers and the dispatcher.
pub struct GraphRuntimeState {
    pub variable_pool: Arc<VariablePool>,
    pub start_at: DateTime<Utc>,
    total_tokens: AtomicU64,
    node_run_steps: AtomicU32,
    outputs: Mutex<VarMap>,
    execution: GraphExecution,
}

impl GraphRuntimeState {
    #[must_use]
    pub fn new(variable_pool: Arc<VariablePool>) -> Self {
        GraphRuntimeState {
            variable_pool,
            start_at: Utc::now(),
            total_tokens: AtomicU64::new(0),
            node_run_steps: AtomicU32::new(0),
            outputs: Mutex::new(new_var_map()),
            execution: GraphExecution::default(),
        }
    }

    pub fn execution(&self) -> &GraphExecution {
        &self.execution
    }

    pub fn add_tokens(&self, tokens: u64) {
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn node_run_steps(&self) -> u32 {
        self.node_run_steps.load(Ordering::Acquire)
    }

    pub fn increment_node_run_steps(&self) {
        self.node_run_steps.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_output(&self, key: &str, value: Value) {
        self.outputs
            .lock()
            .expect("outputs poisoned")
            .insert(key.to_string(), value);
    }

    /// Bulk-merge response-node outputs into the run outputs.
    pub fn update_outputs(&self, outputs: VarMap) {
        let mut guard = self.outputs.lock().expect("outputs poisoned");
        for (k, v) in outputs {
            guard.insert(k, v);
        }
    }

    /// Copy of the run outputs.
    #[must_use]
    pub fn outputs(&self) -> VarMap {
        self.outputs.lock().expect("outputs poisoned").clone()
    }

    /// JSON snapshot of the runtime state.
    #[must_use]
    pub fn dump(&self) -> Value {
        let outputs: serde_json::Map<String, Value> = self
            .outputs()
            .into_iter()
            .collect();
        json!({
            "version": "1.0",
            "start_at": self.start_at.timestamp_millis(),
            "total_tokens": self.total_tokens(),
            "node_run_steps": self.node_run_steps(),
            "outputs": Value::Object(outputs),
            "variable_pool": self.variable_pool.snapshot(),
            "execution": self.execution.dump(),
        })
    }
}

#[derive(Debug, Default)]
struct ExecutionInner {
    started: bool,
    completed: bool,
    aborted: bool,
    paused: bool,
    error: Option<String>,
    exceptions_count: u32,
}

/// Aggregate tracking the overall execution outcome.
#[derive(Debug, Default)]
pub struct GraphExecution {
    inner: Mutex<ExecutionInner>,
}

impl GraphExecution {
    pub fn start(&self) {
        self.inner.lock().expect("execution poisoned").started = true;
    }

    pub fn complete(&self) {
        self.inner.lock().expect("execution poisoned").completed = true;
    }

    pub fn abort(&self, reason: &str) {
        let mut inner = self.inner.lock().expect("execution poisoned");
        inner.aborted = true;
        if !reason.is_empty() {
            inner.error = Some(format!("aborted: {reason}"));
        }
    }

    pub fn pause(&self) {
        self.inner.lock().expect("execution poisoned").paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().expect("execution poisoned").paused = false;
    }

    /// Record an unrecoverable error; the run terminates with it.
    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock().expect("execution poisoned");
        inner.error = Some(error.into());
        inner.completed = true;
    }

    pub fn increment_exceptions(&self) {
        self.inner.lock().expect("execution poisoned").exceptions_count += 1;
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.inner.lock().expect("execution poisoned").error.is_some()
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.lock().expect("execution poisoned").error.clone()
    }

    #[must_use]
    pub fn exceptions_count(&self) -> u32 {
        self.inner.lock().expect("execution poisoned").exceptions_count
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().expect("execution poisoned").aborted
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.lock().expect("execution poisoned").completed
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("execution poisoned").paused
    }

    #[must_use]
    pub fn dump(&self) -> Value {
        let inner = self.inner.lock().expect("execution poisoned");
        json!({
            "started": inner.started,
            "completed": inner.completed,
            "aborted": inner.aborted,
            "paused": inner.paused,
            "error": inner.error.clone().unwrap_or_default(),
            "exceptions_count": inner.exceptions_count,
        })
    }
}

//! In-process repository with the same tenant gating as the Postgres
//! backend; the test double for everything persistence-shaped.

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{
    LlmTraceRecord, NodeExecutionRecord, RecorderError, RunRepository, WorkflowRun,
};
use crate::types::TenantScope;

#[derive(Default)]
struct Tables {
    runs: FxHashMap<String, WorkflowRun>,
    /// (run_id, node_id) uniqueness mirrors the relational constraint.
    node_executions: FxHashMap<(String, String), NodeExecutionRecord>,
    llm_traces: Vec<LlmTraceRecord>,
    conversation_traces: FxHashMap<String, Vec<Value>>,
    ownership: FxHashMap<String, TenantScope>,
}

/// In-memory [`RunRepository`].
#[derive(Default)]
pub struct InMemoryRunRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRunRepository {
    #[must_use]
    pub fn new() -> Self {
        InMemoryRunRepository::default()
    }

    /// Number of stored runs (test helper).
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.tables.lock().expect("tables poisoned").runs.len()
    }
}

fn run_in_scope(run: &WorkflowRun, scope: Option<&TenantScope>) -> bool {
    match scope {
        None => true,
        Some(scope) => {
            run.org_id.as_deref() == Some(scope.org_id.as_str())
                && run.tenant_id.as_deref() == Some(scope.tenant_id.as_str())
        }
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save_run(
        &self,
        scope: Option<&TenantScope>,
        run: &WorkflowRun,
    ) -> Result<(), RecorderError> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        if let Some(existing) = tables.runs.get(&run.id) {
            if !run_in_scope(existing, scope) {
                return Err(RecorderError::ScopeViolation {
                    entity: "run",
                    id: run.id.clone(),
                });
            }
        }

        let mut stored = run.clone();
        if let Some(scope) = scope {
            stored.org_id = Some(scope.org_id.clone());
            stored.tenant_id = Some(scope.tenant_id.clone());
        }
        tables.runs.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_run(
        &self,
        scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Option<WorkflowRun>, RecorderError> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables
            .runs
            .get(run_id)
            .filter(|run| run_in_scope(run, scope))
            .cloned())
    }

    async fn batch_create_node_executions(
        &self,
        scope: Option<&TenantScope>,
        records: &[NodeExecutionRecord],
    ) -> Result<(), RecorderError> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        for record in records {
            if let Some(run) = tables.runs.get(&record.run_id) {
                if !run_in_scope(run, scope) {
                    return Err(RecorderError::ScopeViolation {
                        entity: "node_execution",
                        id: record.run_id.clone(),
                    });
                }
            }
            let key = (record.run_id.clone(), record.execution.node_id.clone());
            // ON CONFLICT DO NOTHING: the first write wins.
            tables.node_executions.entry(key).or_insert_with(|| record.clone());
        }
        Ok(())
    }

    async fn list_node_executions(
        &self,
        scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Vec<NodeExecutionRecord>, RecorderError> {
        let tables = self.tables.lock().expect("tables poisoned");
        if let Some(run) = tables.runs.get(run_id) {
            if !run_in_scope(run, scope) {
                return Ok(Vec::new());
            }
        }
        let mut records: Vec<NodeExecutionRecord> = tables
            .node_executions
            .values()
            .filter(|record| record.run_id == run_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.execution.started_at.cmp(&b.execution.started_at));
        Ok(records)
    }

    async fn create_llm_trace(
        &self,
        _scope: Option<&TenantScope>,
        record: &LlmTraceRecord,
    ) -> Result<(), RecorderError> {
        self.tables
            .lock()
            .expect("tables poisoned")
            .llm_traces
            .push(record.clone());
        Ok(())
    }

    async fn list_llm_traces(
        &self,
        _scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Vec<LlmTraceRecord>, RecorderError> {
        let tables = self.tables.lock().expect("tables poisoned");
        Ok(tables
            .llm_traces
            .iter()
            .filter(|trace| trace.conversation_id.as_deref() == Some(conversation_id))
            .cloned()
            .collect())
    }

    async fn append_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        trace: &Value,
    ) -> Result<(), RecorderError> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        if let (Some(scope), Some(owner)) = (scope, tables.ownership.get(conversation_id)) {
            if owner != scope {
                return Err(RecorderError::ScopeViolation {
                    entity: "conversation_trace",
                    id: conversation_id.to_string(),
                });
            }
        }
        tables
            .conversation_traces
            .entry(conversation_id.to_string())
            .or_default()
            .push(trace.clone());
        Ok(())
    }

    async fn get_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<Value>, RecorderError> {
        let tables = self.tables.lock().expect("tables poisoned");
        if let (Some(scope), Some(owner)) = (scope, tables.ownership.get(conversation_id)) {
            if owner != scope {
                return Ok(None);
            }
        }
        Ok(tables
            .conversation_traces
            .get(conversation_id)
            .map(|traces| Value::Array(traces.clone())))
    }

    async fn ensure_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError> {
        let mut tables = self.tables.lock().expect("tables poisoned");
        match tables.ownership.get(conversation_id) {
            None => {
                tables
                    .ownership
                    .insert(conversation_id.to_string(), scope.clone());
                Ok(())
            }
            Some(owner) if owner == scope => Ok(()),
            Some(_) => Err(RecorderError::ConversationConflict {
                conversation_id: conversation_id.to_string(),
            }),
        }
    }

    async fn validate_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError> {
        let tables = self.tables.lock().expect("tables poisoned");
        match tables.ownership.get(conversation_id) {
            None => Ok(()),
            Some(owner) if owner == scope => Ok(()),
            Some(_) => Err(RecorderError::ConversationConflict {
                conversation_id: conversation_id.to_string(),
            }),
        }
    }
}

//! Tenant-scoped run persistence.
//!
//! The [`RunRecorder`] accepts a run aggregate plus the node-execution
//! records collected by the engine and persists both through a
//! [`RunRepository`]. Node batches are idempotent on `(run_id, node_id)`
//! — at-least-once delivery is fine. When a node record carries an
//! `llm_trace` metadata payload, the recorder fans it out to the
//! standalone trace table and the per-conversation JSON array trace.
//!
//! Every repository call takes an explicit `(org_id, tenant_id)` scope:
//! reads filter by it, writes refuse to cross it, and conversation
//! ownership is asserted through a conditional upsert whose conflict
//! sentinel callers map to HTTP 409 `conversation_id_conflict`.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRunRepository;
pub use postgres::PostgresRunRepository;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{NodeExecutionStatus, RunStatus, TenantScope, VarMap};

/// Errors of the persistence layer.
#[derive(Debug, Error, Diagnostic)]
pub enum RecorderError {
    /// The conversation is owned by a different `(org, tenant)`.
    #[error("conversation_id_conflict: {conversation_id} is owned by another tenant")]
    #[diagnostic(
        code(flowweave::recorder::conversation_id_conflict),
        help("Use a fresh conversation_id or the owning tenant's credentials.")
    )]
    ConversationConflict { conversation_id: String },

    /// A write attempted to cross its tenant scope.
    #[error("tenant scope violation on {entity} {id}")]
    #[diagnostic(code(flowweave::recorder::scope_violation))]
    ScopeViolation { entity: &'static str, id: String },

    #[error("run not found: {run_id}")]
    #[diagnostic(code(flowweave::recorder::run_not_found))]
    RunNotFound { run_id: String },

    #[error("persistence error: {0}")]
    #[diagnostic(code(flowweave::recorder::store))]
    Store(String),

    #[error(transparent)]
    #[diagnostic(code(flowweave::recorder::serde))]
    Serde(#[from] serde_json::Error),
}

/// The root aggregate of one workflow execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A fresh `running` aggregate.
    #[must_use]
    pub fn started(workflow_id: impl Into<String>, scope: Option<&TenantScope>) -> Self {
        WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            org_id: scope.map(|s| s.org_id.clone()),
            tenant_id: scope.map(|s| s.tenant_id.clone()),
            conversation_id: None,
            status: RunStatus::Running,
            inputs: None,
            outputs: None,
            error: None,
            total_tokens: 0,
            total_steps: 0,
            elapsed_ms: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Per-attempt node snapshot collected by the engine's dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub status: NodeExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<VarMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VarMap>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Row shape of the standalone node-execution table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: String,
    pub run_id: String,
    #[serde(flatten)]
    pub execution: NodeExecution,
}

impl NodeExecutionRecord {
    #[must_use]
    pub fn from_execution(run_id: &str, execution: NodeExecution) -> Self {
        NodeExecutionRecord {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            execution,
        }
    }
}

/// Row shape of the standalone LLM-call trace table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTraceRecord {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub node_id: String,
    pub provider: String,
    pub model: String,
    /// The full `llm_trace` payload produced by the LLM node.
    pub trace: Value,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// The persistence capability the recorder consumes.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or update the run aggregate.
    async fn save_run(
        &self,
        scope: Option<&TenantScope>,
        run: &WorkflowRun,
    ) -> Result<(), RecorderError>;

    async fn get_run(
        &self,
        scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Option<WorkflowRun>, RecorderError>;

    /// One multi-row insert, idempotent on `(run_id, node_id)`.
    async fn batch_create_node_executions(
        &self,
        scope: Option<&TenantScope>,
        records: &[NodeExecutionRecord],
    ) -> Result<(), RecorderError>;

    async fn list_node_executions(
        &self,
        scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Vec<NodeExecutionRecord>, RecorderError>;

    async fn create_llm_trace(
        &self,
        scope: Option<&TenantScope>,
        record: &LlmTraceRecord,
    ) -> Result<(), RecorderError>;

    async fn list_llm_traces(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Vec<LlmTraceRecord>, RecorderError>;

    /// Append one trace entry to the conversation's JSON array.
    async fn append_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        trace: &Value,
    ) -> Result<(), RecorderError>;

    async fn get_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<Value>, RecorderError>;

    /// Upsert the ownership row; the conflict sentinel signals a
    /// conversation owned by a different scope. The row is never
    /// mutated on conflict.
    async fn ensure_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError>;

    /// Read-only ownership check.
    async fn validate_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError>;
}

/// Persists run aggregates and node batches off the hot path.
pub struct RunRecorder {
    repository: Arc<dyn RunRepository>,
}

impl RunRecorder {
    #[must_use]
    pub fn new(repository: Arc<dyn RunRepository>) -> Self {
        RunRecorder { repository }
    }

    #[must_use]
    pub fn repository(&self) -> Arc<dyn RunRepository> {
        self.repository.clone()
    }

    /// Persist a finished run and its node executions; LLM traces found
    /// in node metadata fan out to both trace sinks.
    pub async fn record(
        &self,
        scope: Option<&TenantScope>,
        run: &WorkflowRun,
        executions: &[NodeExecution],
    ) -> Result<(), RecorderError> {
        self.repository.save_run(scope, run).await?;

        let records: Vec<NodeExecutionRecord> = executions
            .iter()
            .map(|execution| NodeExecutionRecord::from_execution(&run.id, execution.clone()))
            .collect();
        self.repository
            .batch_create_node_executions(scope, &records)
            .await?;

        for execution in executions {
            let Some(trace) = execution
                .metadata
                .as_ref()
                .and_then(|m| m.get("llm_trace"))
            else {
                continue;
            };

            let record = LlmTraceRecord {
                id: Uuid::new_v4().to_string(),
                run_id: run.id.clone(),
                conversation_id: run.conversation_id.clone(),
                node_id: execution.node_id.clone(),
                provider: trace
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                model: trace
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                trace: trace.clone(),
                elapsed_ms: trace
                    .get("elapsed_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
                created_at: Utc::now(),
            };
            self.repository.create_llm_trace(scope, &record).await?;

            if let Some(conversation_id) = &run.conversation_id {
                self.repository
                    .append_conversation_trace(scope, conversation_id, trace)
                    .await?;
            }
        }

        Ok(())
    }
}

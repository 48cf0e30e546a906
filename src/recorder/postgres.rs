//! Postgres repository.
//!
//! Node batches use one multi-row insert with
//! `ON CONFLICT (run_id, node_id) DO NOTHING`; conversation ownership is
//! a conditional upsert on the `conversations` primary key whose empty
//! `RETURNING` set signals the conflict sentinel.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{
    LlmTraceRecord, NodeExecutionRecord, RecorderError, RunRepository, WorkflowRun,
};
use crate::types::{NodeExecutionStatus, RunStatus, TenantScope};

/// Relational [`RunRepository`] over sqlx.
pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        PostgresRunRepository { pool }
    }

    /// Create the backing tables when absent.
    pub async fn ensure_schema(&self) -> Result<(), RecorderError> {
        for ddl in [
            r"CREATE TABLE IF NOT EXISTS workflow_runs (
                id              TEXT PRIMARY KEY,
                workflow_id     TEXT NOT NULL,
                org_id          TEXT,
                tenant_id       TEXT,
                conversation_id TEXT,
                status          TEXT NOT NULL,
                inputs          JSONB,
                outputs         JSONB,
                error           TEXT,
                total_tokens    BIGINT NOT NULL DEFAULT 0,
                total_steps     INTEGER NOT NULL DEFAULT 0,
                elapsed_ms      BIGINT NOT NULL DEFAULT 0,
                started_at      TIMESTAMPTZ NOT NULL,
                finished_at     TIMESTAMPTZ
            )",
            r"CREATE TABLE IF NOT EXISTS node_executions (
                id         TEXT PRIMARY KEY,
                run_id     TEXT NOT NULL,
                node_id    TEXT NOT NULL,
                node_type  TEXT NOT NULL,
                title      TEXT NOT NULL DEFAULT '',
                status     TEXT NOT NULL,
                outputs    JSONB,
                error      TEXT,
                metadata   JSONB,
                elapsed_ms BIGINT NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ NOT NULL,
                UNIQUE (run_id, node_id)
            )",
            r"CREATE TABLE IF NOT EXISTS llm_call_traces (
                id              TEXT PRIMARY KEY,
                run_id          TEXT,
                conversation_id TEXT,
                org_id          TEXT,
                tenant_id       TEXT,
                node_id         TEXT NOT NULL,
                provider        TEXT NOT NULL,
                model           TEXT NOT NULL,
                trace           JSONB NOT NULL,
                elapsed_ms      BIGINT NOT NULL DEFAULT 0,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            r"CREATE TABLE IF NOT EXISTS conversation_traces (
                conversation_id TEXT PRIMARY KEY,
                org_id          TEXT,
                tenant_id       TEXT,
                traces          JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            r"CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                org_id          TEXT NOT NULL,
                tenant_id       TEXT NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> RecorderError {
    RecorderError::Store(err.to_string())
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
    }
}

fn parse_run_status(raw: &str) -> RunStatus {
    match raw {
        "succeeded" => RunStatus::Succeeded,
        "failed" => RunStatus::Failed,
        "aborted" => RunStatus::Aborted,
        _ => RunStatus::Running,
    }
}

fn node_status_str(status: NodeExecutionStatus) -> &'static str {
    match status {
        NodeExecutionStatus::Succeeded => "succeeded",
        NodeExecutionStatus::Failed => "failed",
        NodeExecutionStatus::Skipped => "skipped",
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn save_run(
        &self,
        scope: Option<&TenantScope>,
        run: &WorkflowRun,
    ) -> Result<(), RecorderError> {
        let org_id = scope.map(|s| s.org_id.as_str()).or(run.org_id.as_deref());
        let tenant_id = scope
            .map(|s| s.tenant_id.as_str())
            .or(run.tenant_id.as_deref());

        // The conditional update refuses to cross an existing row's
        // scope; an untouched conflict row surfaces as a violation.
        let row = sqlx::query(
            r"INSERT INTO workflow_runs
                  (id, workflow_id, org_id, tenant_id, conversation_id, status, inputs,
                   outputs, error, total_tokens, total_steps, elapsed_ms, started_at, finished_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
              ON CONFLICT (id) DO UPDATE
              SET status = EXCLUDED.status,
                  outputs = EXCLUDED.outputs,
                  error = EXCLUDED.error,
                  total_tokens = EXCLUDED.total_tokens,
                  total_steps = EXCLUDED.total_steps,
                  elapsed_ms = EXCLUDED.elapsed_ms,
                  finished_at = EXCLUDED.finished_at
              WHERE workflow_runs.org_id IS NOT DISTINCT FROM EXCLUDED.org_id
                AND workflow_runs.tenant_id IS NOT DISTINCT FROM EXCLUDED.tenant_id
              RETURNING id",
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(org_id)
        .bind(tenant_id)
        .bind(&run.conversation_id)
        .bind(status_str(run.status))
        .bind(&run.inputs)
        .bind(&run.outputs)
        .bind(&run.error)
        .bind(run.total_tokens as i64)
        .bind(run.total_steps as i32)
        .bind(run.elapsed_ms as i64)
        .bind(run.started_at)
        .bind(run.finished_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if row.is_none() {
            return Err(RecorderError::ScopeViolation {
                entity: "run",
                id: run.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_run(
        &self,
        scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Option<WorkflowRun>, RecorderError> {
        let row = match scope {
            Some(scope) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs
                     WHERE id = $1 AND org_id = $2 AND tenant_id = $3",
                )
                .bind(run_id)
                .bind(&scope.org_id)
                .bind(&scope.tenant_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs WHERE id = $1")
                    .bind(run_id)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        Ok(row.map(|row| WorkflowRun {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            org_id: row.get("org_id"),
            tenant_id: row.get("tenant_id"),
            conversation_id: row.get("conversation_id"),
            status: parse_run_status(row.get::<String, _>("status").as_str()),
            inputs: row.get("inputs"),
            outputs: row.get("outputs"),
            error: row.get("error"),
            total_tokens: row.get::<i64, _>("total_tokens").max(0) as u64,
            total_steps: row.get::<i32, _>("total_steps").max(0) as u32,
            elapsed_ms: row.get::<i64, _>("elapsed_ms").max(0) as u64,
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        }))
    }

    async fn batch_create_node_executions(
        &self,
        _scope: Option<&TenantScope>,
        records: &[NodeExecutionRecord],
    ) -> Result<(), RecorderError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut sql = String::from(
            "INSERT INTO node_executions \
             (id, run_id, node_id, node_type, title, status, outputs, error, metadata, elapsed_ms, started_at) VALUES ",
        );
        for i in 0..records.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * 11;
            sql.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8,
                base + 9,
                base + 10,
                base + 11
            ));
        }
        sql.push_str(" ON CONFLICT (run_id, node_id) DO NOTHING");

        let mut query = sqlx::query(&sql);
        for record in records {
            let outputs = record
                .execution
                .outputs
                .as_ref()
                .map(|o| serde_json::to_value(o))
                .transpose()?;
            let metadata = record
                .execution
                .metadata
                .as_ref()
                .map(|m| serde_json::to_value(m))
                .transpose()?;
            query = query
                .bind(record.id.clone())
                .bind(record.run_id.clone())
                .bind(record.execution.node_id.clone())
                .bind(record.execution.node_type.clone())
                .bind(record.execution.title.clone())
                .bind(node_status_str(record.execution.status))
                .bind(outputs)
                .bind(record.execution.error.clone())
                .bind(metadata)
                .bind(record.execution.elapsed_ms as i64)
                .bind(record.execution.started_at);
        }

        query.execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn list_node_executions(
        &self,
        _scope: Option<&TenantScope>,
        run_id: &str,
    ) -> Result<Vec<NodeExecutionRecord>, RecorderError> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE run_id = $1 ORDER BY started_at",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let outputs: Option<Value> = row.get("outputs");
            let metadata: Option<Value> = row.get("metadata");
            records.push(NodeExecutionRecord {
                id: row.get("id"),
                run_id: row.get("run_id"),
                execution: super::NodeExecution {
                    node_id: row.get("node_id"),
                    node_type: row.get("node_type"),
                    title: row.get("title"),
                    status: match row.get::<String, _>("status").as_str() {
                        "failed" => NodeExecutionStatus::Failed,
                        "skipped" => NodeExecutionStatus::Skipped,
                        _ => NodeExecutionStatus::Succeeded,
                    },
                    outputs: outputs.map(serde_json::from_value).transpose()?,
                    error: row.get("error"),
                    metadata: metadata.map(serde_json::from_value).transpose()?,
                    started_at: row.get("started_at"),
                    elapsed_ms: row.get::<i64, _>("elapsed_ms").max(0) as u64,
                },
            });
        }
        Ok(records)
    }

    async fn create_llm_trace(
        &self,
        scope: Option<&TenantScope>,
        record: &LlmTraceRecord,
    ) -> Result<(), RecorderError> {
        sqlx::query(
            r"INSERT INTO llm_call_traces
                  (id, run_id, conversation_id, org_id, tenant_id, node_id, provider, model,
                   trace, elapsed_ms, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&record.id)
        .bind(&record.run_id)
        .bind(&record.conversation_id)
        .bind(scope.map(|s| s.org_id.as_str()))
        .bind(scope.map(|s| s.tenant_id.as_str()))
        .bind(&record.node_id)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(&record.trace)
        .bind(record.elapsed_ms as i64)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_llm_traces(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Vec<LlmTraceRecord>, RecorderError> {
        let rows = match scope {
            Some(scope) => {
                sqlx::query(
                    "SELECT * FROM llm_call_traces
                     WHERE conversation_id = $1 AND org_id = $2 AND tenant_id = $3
                     ORDER BY created_at",
                )
                .bind(conversation_id)
                .bind(&scope.org_id)
                .bind(&scope.tenant_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM llm_call_traces WHERE conversation_id = $1 ORDER BY created_at",
                )
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|row| LlmTraceRecord {
                id: row.get("id"),
                run_id: row.get("run_id"),
                conversation_id: row.get("conversation_id"),
                node_id: row.get("node_id"),
                provider: row.get("provider"),
                model: row.get("model"),
                trace: row.get("trace"),
                elapsed_ms: row.get::<i64, _>("elapsed_ms").max(0) as u64,
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn append_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        trace: &Value,
    ) -> Result<(), RecorderError> {
        let (org_id, tenant_id) = match scope {
            Some(scope) => (Some(scope.org_id.as_str()), Some(scope.tenant_id.as_str())),
            None => (None, None),
        };
        sqlx::query(
            r"INSERT INTO conversation_traces (conversation_id, org_id, tenant_id, traces, updated_at)
              VALUES ($1, $2, $3, jsonb_build_array($4::jsonb), NOW())
              ON CONFLICT (conversation_id) DO UPDATE
              SET traces = conversation_traces.traces || $4::jsonb,
                  updated_at = NOW()",
        )
        .bind(conversation_id)
        .bind(org_id)
        .bind(tenant_id)
        .bind(trace)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_conversation_trace(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<Value>, RecorderError> {
        let row = match scope {
            Some(scope) => {
                sqlx::query(
                    "SELECT traces FROM conversation_traces
                     WHERE conversation_id = $1 AND org_id = $2 AND tenant_id = $3",
                )
                .bind(conversation_id)
                .bind(&scope.org_id)
                .bind(&scope.tenant_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT traces FROM conversation_traces WHERE conversation_id = $1")
                    .bind(conversation_id)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        Ok(row.map(|row| row.get("traces")))
    }

    async fn ensure_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError> {
        // The DO UPDATE only fires for the owning scope, so a conflict
        // row owned elsewhere yields no row and stays untouched.
        let row = sqlx::query(
            r"INSERT INTO conversations (conversation_id, org_id, tenant_id, created_at, updated_at)
              VALUES ($1, $2, $3, NOW(), NOW())
              ON CONFLICT (conversation_id) DO UPDATE
              SET updated_at = NOW()
              WHERE conversations.org_id = EXCLUDED.org_id
                AND conversations.tenant_id = EXCLUDED.tenant_id
              RETURNING conversation_id",
        )
        .bind(conversation_id)
        .bind(&scope.org_id)
        .bind(&scope.tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if row.is_none() {
            return Err(RecorderError::ConversationConflict {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn validate_conversation_ownership(
        &self,
        conversation_id: &str,
        scope: &TenantScope,
    ) -> Result<(), RecorderError> {
        let row = sqlx::query("SELECT org_id, tenant_id FROM conversations WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            None => Ok(()),
            Some(row) => {
                let org_id: String = row.get("org_id");
                let tenant_id: String = row.get("tenant_id");
                if org_id == scope.org_id && tenant_id == scope.tenant_id {
                    Ok(())
                } else {
                    Err(RecorderError::ConversationConflict {
                        conversation_id: conversation_id.to_string(),
                    })
                }
            }
        }
    }
}

//! Postgres summary store.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::mtm::{ConversationSummary, MidTermMemory};
use super::MemoryError;
use crate::types::TenantScope;

/// Relational [`MidTermMemory`] backed by a `conversation_summaries`
/// table with a conditional upsert keyed on `conversation_id`.
pub struct PostgresMtmStore {
    pool: PgPool,
}

impl PostgresMtmStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        PostgresMtmStore { pool }
    }

    /// Create the backing table when absent.
    pub async fn ensure_schema(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS conversation_summaries (
                conversation_id TEXT PRIMARY KEY,
                org_id          TEXT,
                tenant_id       TEXT,
                content         TEXT NOT NULL,
                turns_covered   INTEGER NOT NULL DEFAULT 0,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> MemoryError {
    MemoryError::Store(err.to_string())
}

#[async_trait]
impl MidTermMemory for PostgresMtmStore {
    async fn load_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, MemoryError> {
        let row = match scope {
            Some(scope) => {
                sqlx::query(
                    "SELECT content, turns_covered, updated_at
                     FROM conversation_summaries
                     WHERE conversation_id = $1 AND org_id = $2 AND tenant_id = $3",
                )
                .bind(conversation_id)
                .bind(&scope.org_id)
                .bind(&scope.tenant_id)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT content, turns_covered, updated_at
                     FROM conversation_summaries
                     WHERE conversation_id = $1",
                )
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;

        Ok(row.map(|row| ConversationSummary {
            content: row.get::<String, _>("content"),
            turns_covered: row.get::<i32, _>("turns_covered").max(0) as usize,
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        summary: &ConversationSummary,
    ) -> Result<(), MemoryError> {
        let (org_id, tenant_id) = match scope {
            Some(scope) => (Some(scope.org_id.as_str()), Some(scope.tenant_id.as_str())),
            None => (None, None),
        };

        sqlx::query(
            "INSERT INTO conversation_summaries
                 (conversation_id, org_id, tenant_id, content, turns_covered, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (conversation_id) DO UPDATE
             SET content = EXCLUDED.content,
                 turns_covered = EXCLUDED.turns_covered,
                 updated_at = NOW()",
        )
        .bind(conversation_id)
        .bind(org_id)
        .bind(tenant_id)
        .bind(&summary.content)
        .bind(summary.turns_covered as i32)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

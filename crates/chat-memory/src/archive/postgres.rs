use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{error, info};

use super::{ArchiveStore, StoredRecord, WriteCondition};
use crate::models::{ArchivedSummary, SessionRecord};
use crate::utils::{SessionError, SessionResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_sessions (
    conversation_id TEXT PRIMARY KEY,
    document        JSONB       NOT NULL,
    version         BIGINT      NOT NULL DEFAULT 1,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    persisted_at    TIMESTAMPTZ,
    message_count   BIGINT      NOT NULL DEFAULT 0,
    merge_count     BIGINT      NOT NULL DEFAULT 0
)
"#;

const SCHEMA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_chat_sessions_updated_at ON chat_sessions (updated_at DESC)";

#[derive(Debug, FromRow)]
struct DocumentRow {
    document: Json<SessionRecord>,
    version: i64,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    conversation_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    persisted_at: Option<DateTime<Utc>>,
    message_count: i64,
    merge_count: i64,
}

impl From<SummaryRow> for ArchivedSummary {
    fn from(row: SummaryRow) -> Self {
        ArchivedSummary {
            conversation_id: row.conversation_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            message_count: row.message_count.max(0) as usize,
            merge_count: row.merge_count.max(0) as u64,
            persisted_at: row.persisted_at,
        }
    }
}

/// Etags are the row's version column rendered as text
fn parse_version(etag: &str) -> Option<i64> {
    etag.parse::<i64>().ok().filter(|v| *v > 0)
}

/// Postgres-backed archive, one JSONB document per conversation
pub struct PgArchiveStore {
    pool: PgPool,
}

impl PgArchiveStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> SessionResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(3))
            .connect(url)
            .await?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!("✅ Archive database connection established");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> SessionResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(SCHEMA_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn load(&self, id: &str) -> SessionResult<Option<StoredRecord>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            SELECT document, version
            FROM chat_sessions
            WHERE conversation_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e: sqlx::Error| {
            error!("Database error loading session {}: {}", id, e);
            SessionError::from(e)
        })?;

        match row {
            Some(row) => Ok(Some(StoredRecord {
                record: row.document.0.validate()?,
                etag: row.version.to_string(),
            })),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        id: &str,
        record: &SessionRecord,
        condition: WriteCondition,
    ) -> SessionResult<String> {
        let version: Option<i64> = match condition {
            WriteCondition::IfAbsent => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO chat_sessions
                        (conversation_id, document, version, created_at, updated_at,
                         persisted_at, message_count, merge_count)
                    VALUES ($1, $2, 1, $3, $4, $5, $6, $7)
                    ON CONFLICT (conversation_id) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(id)
                .bind(Json(record))
                .bind(record.created_at)
                .bind(record.updated_at)
                .bind(record.persisted_at)
                .bind(record.messages.len() as i64)
                .bind(record.merge_count as i64)
                .fetch_optional(&self.pool)
                .await?
            }
            WriteCondition::IfMatch(etag) => {
                let Some(expected) = parse_version(&etag) else {
                    return Err(SessionError::PreconditionFailed(id.to_string()));
                };
                sqlx::query_scalar(
                    r#"
                    UPDATE chat_sessions
                    SET document = $2,
                        version = version + 1,
                        created_at = $3,
                        updated_at = $4,
                        persisted_at = $5,
                        message_count = $6,
                        merge_count = $7
                    WHERE conversation_id = $1 AND version = $8
                    RETURNING version
                    "#,
                )
                .bind(id)
                .bind(Json(record))
                .bind(record.created_at)
                .bind(record.updated_at)
                .bind(record.persisted_at)
                .bind(record.messages.len() as i64)
                .bind(record.merge_count as i64)
                .bind(expected)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        version
            .map(|v| v.to_string())
            .ok_or_else(|| SessionError::PreconditionFailed(id.to_string()))
    }

    async fn remove(&self, id: &str) -> SessionResult<bool> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE conversation_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, limit: usize) -> SessionResult<Vec<ArchivedSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT conversation_id, created_at, updated_at, persisted_at,
                   message_count, merge_count
            FROM chat_sessions
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn ping(&self) -> SessionResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

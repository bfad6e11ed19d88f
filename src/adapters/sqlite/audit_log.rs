//! SQLite implementation of the append-only audit log.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::AuditEntry;
use crate::domain::ports::AuditLog;

#[derive(Clone)]
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn append(&self, entry: &AuditEntry) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO audit_log
              (id, task_id, from_state, to_state, actor, before_json, after_json, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.task_id.to_string())
        .bind(&entry.from_state)
        .bind(&entry.to_state)
        .bind(&entry.actor)
        .bind(&entry.before_json)
        .bind(&entry.after_json)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_task(&self, task_id: Uuid) -> DomainResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT * FROM audit_log WHERE task_id = ? ORDER BY created_at, id",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_for_task(&self, task_id: Uuid) -> DomainResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    task_id: String,
    from_state: String,
    to_state: String,
    actor: String,
    before_json: Option<String>,
    after_json: String,
    created_at: String,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = DomainError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: super::row::uuid("audit_log.id", &row.id)?,
            task_id: super::row::uuid("audit_log.task_id", &row.task_id)?,
            from_state: row.from_state,
            to_state: row.to_state,
            actor: row.actor,
            before_json: row.before_json,
            after_json: row.after_json,
            created_at: super::row::datetime("audit_log.created_at", &row.created_at)?,
        })
    }
}

//! SQLite persistence for templates, schedule state, and approvals.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Approval, ApprovalStatus, ScheduleState, TaskTemplate};
use crate::domain::ports::{ApprovalRepository, ScheduleStateRepository, TemplateRepository};

#[derive(Clone)]
pub struct SqliteTemplateRepository {
    pool: SqlitePool,
}

impl SqliteTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqliteTemplateRepository {
    async fn upsert(&self, template: &TaskTemplate) -> DomainResult<()> {
        let definition = serde_json::to_string(template)?;
        sqlx::query(
            r"INSERT INTO templates (name, definition, updated_at) VALUES (?, ?, ?)
              ON CONFLICT(name) DO UPDATE SET definition = excluded.definition,
                                              updated_at = excluded.updated_at",
        )
        .bind(&template.name)
        .bind(&definition)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> DomainResult<Option<TaskTemplate>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT definition FROM templates WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(definition,)| serde_json::from_str(&definition))
            .transpose()
            .map_err(|e| DomainError::Serialization(e.to_string()))
    }

    async fn list(&self) -> DomainResult<Vec<TaskTemplate>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT definition FROM templates ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(definition,)| {
                serde_json::from_str(&definition)
                    .map_err(|e| DomainError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn delete(&self, name: &str) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM templates WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::TemplateNotFound(name.to_string()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteScheduleStateRepository {
    pool: SqlitePool,
}

impl SqliteScheduleStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStateRepository for SqliteScheduleStateRepository {
    async fn get(&self, template_name: &str) -> DomainResult<Option<ScheduleState>> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT last_run_at, next_run_at FROM schedule_state WHERE template_name = ?",
        )
        .bind(template_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((last, next)) => Ok(Some(ScheduleState {
                template_name: template_name.to_string(),
                last_run_at: super::row::datetime_opt("schedule_state.last_run_at", last)?,
                next_run_at: super::row::datetime_opt("schedule_state.next_run_at", next)?,
            })),
            None => Ok(None),
        }
    }

    async fn put(&self, state: &ScheduleState) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO schedule_state (template_name, last_run_at, next_run_at) VALUES (?, ?, ?)
              ON CONFLICT(template_name) DO UPDATE SET last_run_at = excluded.last_run_at,
                                                       next_run_at = excluded.next_run_at",
        )
        .bind(&state.template_name)
        .bind(state.last_run_at.map(|t| t.to_rfc3339()))
        .bind(state.next_run_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteApprovalRepository {
    pool: SqlitePool,
}

impl SqliteApprovalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalRepository for SqliteApprovalRepository {
    async fn create(&self, approval: &Approval) -> DomainResult<()> {
        sqlx::query(
            r"INSERT INTO approvals (id, task_id, status, feedback, created_at, resolved_at)
              VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(approval.id.to_string())
        .bind(approval.task_id.to_string())
        .bind(approval.status.as_str())
        .bind(&approval.feedback)
        .bind(approval.created_at.to_rfc3339())
        .bind(approval.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Approval>> {
        let row: Option<ApprovalRow> = sqlx::query_as("SELECT * FROM approvals WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_pending(&self) -> DomainResult<Vec<Approval>> {
        let rows: Vec<ApprovalRow> =
            sqlx::query_as("SELECT * FROM approvals WHERE status = 'pending' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn resolve(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        feedback: Option<&str>,
    ) -> DomainResult<()> {
        sqlx::query(
            r"UPDATE approvals SET status = ?, feedback = COALESCE(?, feedback), resolved_at = ?
              WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(feedback)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    task_id: String,
    status: String,
    feedback: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl TryFrom<ApprovalRow> for Approval {
    type Error = DomainError;

    fn try_from(row: ApprovalRow) -> Result<Self, Self::Error> {
        let status = ApprovalStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::Serialization(format!("column approvals.status: unknown value {:?}", row.status))
        })?;
        Ok(Approval {
            id: super::row::uuid("approvals.id", &row.id)?,
            task_id: super::row::uuid("approvals.task_id", &row.task_id)?,
            status,
            feedback: row.feedback,
            created_at: super::row::datetime("approvals.created_at", &row.created_at)?,
            resolved_at: super::row::datetime_opt("approvals.resolved_at", row.resolved_at)?,
        })
    }
}

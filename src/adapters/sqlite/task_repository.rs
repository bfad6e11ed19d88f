//! SQLite implementation of the TaskRepository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AuditEntry, BackendConfig, FeedbackEntry, Task, TaskStatus};
use crate::domain::ports::{TaskFilter, TaskRepository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_dependencies(&self, task: &mut Task) -> DomainResult<()> {
        let deps: Vec<(String,)> =
            sqlx::query_as("SELECT depends_on_id FROM task_dependencies WHERE task_id = ? ORDER BY depends_on_id")
                .bind(task.id.to_string())
                .fetch_all(&self.pool)
                .await?;

        task.depends_on = deps
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect();

        Ok(())
    }

    async fn hydrate(&self, rows: Vec<TaskRow>) -> DomainResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            self.load_dependencies(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

fn bind_task_fields<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    task: &'q Task,
    fields: &'q TaskJsonFields,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&task.task_type)
        .bind(&task.backend)
        .bind(task.priority)
        .bind(task.manual_rank)
        .bind(&task.summary)
        .bind(&task.prompt)
        .bind(&fields.acceptance_criteria)
        .bind(&fields.definition_of_done)
        .bind(&fields.backend_config)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(i64::from(task.bounce_count))
        .bind(i64::from(task.max_bounces))
        .bind(&task.lease_owner)
        .bind(fields.lease_expires_at.as_deref())
        .bind(&task.result)
        .bind(&task.evidence_ref)
        .bind(&task.last_error)
        .bind(&fields.feedback_history)
        .bind(&task.pipeline_id)
        .bind(task.pipeline_step)
        .bind(fields.parent_task_id.as_deref())
        .bind(&fields.metadata)
}

/// Pre-serialized JSON columns for one task row.
struct TaskJsonFields {
    acceptance_criteria: String,
    definition_of_done: String,
    backend_config: String,
    feedback_history: String,
    metadata: String,
    lease_expires_at: Option<String>,
    parent_task_id: Option<String>,
}

impl TaskJsonFields {
    fn from_task(task: &Task) -> DomainResult<Self> {
        Ok(Self {
            acceptance_criteria: serde_json::to_string(&task.acceptance_criteria)?,
            definition_of_done: serde_json::to_string(&task.definition_of_done)?,
            backend_config: serde_json::to_string(&task.backend_config)?,
            feedback_history: serde_json::to_string(&task.feedback_history)?,
            metadata: serde_json::to_string(&task.metadata)?,
            lease_expires_at: task.lease_expires_at.map(|t| t.to_rfc3339()),
            parent_task_id: task.parent_task_id.map(|id| id.to_string()),
        })
    }
}

const INSERT_TASK_SQL: &str = r"INSERT INTO tasks (
        task_type, backend, priority, manual_rank, summary, prompt,
        acceptance_criteria, definition_of_done, backend_config, status,
        attempt_count, max_attempts, bounce_count, max_bounces,
        lease_owner, lease_expires_at, result, evidence_ref, last_error,
        feedback_history, pipeline_id, pipeline_step, parent_task_id, metadata,
        id, created_at, updated_at, version)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_TASK_SQL: &str = r"UPDATE tasks SET
        task_type = ?, backend = ?, priority = ?, manual_rank = ?, summary = ?, prompt = ?,
        acceptance_criteria = ?, definition_of_done = ?, backend_config = ?, status = ?,
        attempt_count = ?, max_attempts = ?, bounce_count = ?, max_bounces = ?,
        lease_owner = ?, lease_expires_at = ?, result = ?, evidence_ref = ?, last_error = ?,
        feedback_history = ?, pipeline_id = ?, pipeline_step = ?, parent_task_id = ?, metadata = ?,
        updated_at = ?, version = ?
    WHERE id = ? AND version = ?";

const AUDIT_INSERT_SQL: &str = r"INSERT INTO audit_log
        (id, task_id, from_state, to_state, actor, before_json, after_json, created_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create_with_audit(&self, task: &Task, audit: &AuditEntry) -> DomainResult<()> {
        let fields = TaskJsonFields::from_task(task)?;
        let mut tx = self.pool.begin().await?;

        let query = sqlx::query(INSERT_TASK_SQL);
        bind_task_fields(query, task, &fields)
            .bind(task.id.to_string())
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .bind(task.version)
            .execute(&mut *tx)
            .await?;

        for dep_id in &task.depends_on {
            sqlx::query("INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?, ?)")
                .bind(task.id.to_string())
                .bind(dep_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(AUDIT_INSERT_SQL)
            .bind(audit.id.to_string())
            .bind(audit.task_id.to_string())
            .bind(&audit.from_state)
            .bind(&audit.to_state)
            .bind(&audit.actor)
            .bind(&audit.before_json)
            .bind(&audit.after_json)
            .bind(audit.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let mut task = r.try_into()?;
                self.load_dependencies(&mut task).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(task_type) = &filter.task_type {
            query.push_str(" AND task_type = ?");
            bindings.push(task_type.clone());
        }
        if let Some(pipeline_id) = &filter.pipeline_id {
            query.push_str(" AND pipeline_id = ?");
            bindings.push(pipeline_id.clone());
        }
        if let Some(parent_id) = &filter.parent_task_id {
            query.push_str(" AND parent_task_id = ?");
            bindings.push(parent_id.to_string());
        }
        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn update_with_audit(
        &self,
        task: &Task,
        expected_version: i64,
        audit: &AuditEntry,
    ) -> DomainResult<bool> {
        let fields = TaskJsonFields::from_task(task)?;
        let mut tx = self.pool.begin().await?;

        let query = sqlx::query(UPDATE_TASK_SQL);
        let result = bind_task_fields(query, task, &fields)
            .bind(task.updated_at.to_rfc3339())
            .bind(task.version)
            .bind(task.id.to_string())
            .bind(expected_version)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(AUDIT_INSERT_SQL)
            .bind(audit.id.to_string())
            .bind(audit.task_id.to_string())
            .bind(&audit.from_state)
            .bind(&audit.to_state)
            .bind(&audit.actor)
            .bind(&audit.before_json)
            .bind(&audit.after_json)
            .bind(audit.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(id));
        }

        Ok(())
    }

    async fn list_pending_ordered(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> DomainResult<Vec<Task>> {
        // NULL manual_rank sorts after non-null within the same priority.
        let rows: Vec<TaskRow> = if let Some(task_type) = task_type {
            sqlx::query_as(
                r"SELECT * FROM tasks WHERE status = 'pending' AND task_type = ?
                  ORDER BY priority, manual_rank IS NULL, manual_rank, created_at, id
                  LIMIT ?",
            )
            .bind(task_type)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r"SELECT * FROM tasks WHERE status = 'pending'
                  ORDER BY priority, manual_rank IS NULL, manual_rank, created_at, id
                  LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        self.hydrate(rows).await
    }

    async fn statuses_of(&self, ids: &[Uuid]) -> DomainResult<HashMap<Uuid, TaskStatus>> {
        let mut statuses = HashMap::with_capacity(ids.len());
        for id in ids {
            let row: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            if let Some((status,)) = row {
                if let Some(status) = TaskStatus::from_str(&status) {
                    statuses.insert(*id, status);
                }
            }
        }
        Ok(statuses)
    }

    async fn count_in_progress_by_type(&self) -> DomainResult<HashMap<String, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT task_type, COUNT(*) FROM tasks WHERE status = 'in_progress' GROUP BY task_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(task_type, count)| (task_type, count as u64))
            .collect())
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status_str, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status_str) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    async fn expired_leases(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"SELECT * FROM tasks
              WHERE status = 'in_progress' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?
              ORDER BY lease_expires_at",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn refresh_lease(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            r"UPDATE tasks SET lease_expires_at = ?, updated_at = ?
              WHERE id = ? AND status = 'in_progress' AND lease_owner = ?",
        )
        .bind(expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_manual_rank(&self, id: Uuid, manual_rank: Option<i64>) -> DomainResult<()> {
        let result = sqlx::query("UPDATE tasks SET manual_rank = ?, updated_at = ? WHERE id = ?")
            .bind(manual_rank)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn pending_bucket(&self, priority: i32) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"SELECT * FROM tasks WHERE status = 'pending' AND priority = ?
              ORDER BY manual_rank IS NULL, manual_rank, created_at, id",
        )
        .bind(priority)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn list_by_pipeline(&self, pipeline_id: &str) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks WHERE pipeline_id = ? ORDER BY pipeline_step, created_at",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    backend: Option<String>,
    priority: i32,
    manual_rank: Option<i64>,
    summary: String,
    prompt: String,
    acceptance_criteria: Option<String>,
    definition_of_done: Option<String>,
    backend_config: Option<String>,
    status: String,
    attempt_count: i64,
    max_attempts: i64,
    bounce_count: i64,
    max_bounces: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    result: Option<String>,
    evidence_ref: Option<String>,
    last_error: Option<String>,
    feedback_history: Option<String>,
    pipeline_id: Option<String>,
    pipeline_step: Option<i64>,
    parent_task_id: Option<String>,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let id = super::row::uuid("tasks.id", &row.id)?;
        let parent_task_id = super::row::uuid_opt("tasks.parent_task_id", row.parent_task_id)?;

        let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::Serialization(format!("column tasks.status: unknown value {:?}", row.status))
        })?;

        let acceptance_criteria: Vec<String> =
            super::row::json("tasks.acceptance_criteria", row.acceptance_criteria)?;
        let definition_of_done: Vec<String> =
            super::row::json("tasks.definition_of_done", row.definition_of_done)?;
        let backend_config: BackendConfig =
            super::row::json("tasks.backend_config", row.backend_config)?;
        let feedback_history: Vec<FeedbackEntry> =
            super::row::json("tasks.feedback_history", row.feedback_history)?;
        let metadata: serde_json::Map<String, serde_json::Value> =
            super::row::json("tasks.metadata", row.metadata)?;

        let created_at = super::row::datetime("tasks.created_at", &row.created_at)?;
        let updated_at = super::row::datetime("tasks.updated_at", &row.updated_at)?;
        let lease_expires_at = super::row::datetime_opt("tasks.lease_expires_at", row.lease_expires_at)?;

        Ok(Task {
            id,
            task_type: row.task_type,
            backend: row.backend,
            priority: row.priority,
            manual_rank: row.manual_rank,
            summary: row.summary,
            prompt: row.prompt,
            acceptance_criteria,
            definition_of_done,
            backend_config,
            status,
            attempt_count: row.attempt_count as u32,
            max_attempts: row.max_attempts as u32,
            bounce_count: row.bounce_count as u32,
            max_bounces: row.max_bounces as u32,
            lease_owner: row.lease_owner,
            lease_expires_at,
            result: row.result,
            evidence_ref: row.evidence_ref,
            last_error: row.last_error,
            feedback_history,
            pipeline_id: row.pipeline_id,
            pipeline_step: row.pipeline_step,
            depends_on: Vec::new(), // Loaded separately
            parent_task_id,
            metadata,
            created_at,
            updated_at,
            version: row.version,
        })
    }
}

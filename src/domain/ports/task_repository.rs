//! Task repository port.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AuditEntry, Task, TaskStatus};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub pipeline_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub limit: Option<usize>,
}

/// Repository interface for Task persistence.
///
/// The store writes rows only through `create_with_audit` and
/// `update_with_audit`; both write the row and the audit entry in one
/// transaction. Updates are compare-and-set on `version`: zero rows
/// affected means the caller lost the race.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a task and its creation audit entry atomically.
    async fn create_with_audit(&self, task: &Task, audit: &AuditEntry) -> DomainResult<()>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// List tasks with optional filters, newest first.
    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Write a task row and an audit entry in one transaction, guarded by
    /// `expected_version`. Returns `false` when the row changed underneath.
    async fn update_with_audit(
        &self,
        task: &Task,
        expected_version: i64,
        audit: &AuditEntry,
    ) -> DomainResult<bool>;

    /// Delete a task by ID.
    async fn delete(&self, id: Uuid) -> DomainResult<()>;

    /// Pending tasks in queue order `(priority, manual_rank NULLS LAST,
    /// created_at, id)`, optionally restricted to one task type.
    async fn list_pending_ordered(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> DomainResult<Vec<Task>>;

    /// Status of each of the given ids; missing ids are absent from the map.
    async fn statuses_of(&self, ids: &[Uuid]) -> DomainResult<HashMap<Uuid, TaskStatus>>;

    /// Count of in-progress tasks per task type.
    async fn count_in_progress_by_type(&self) -> DomainResult<HashMap<String, u64>>;

    /// Count tasks by status.
    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>>;

    /// In-progress tasks whose lease deadline (plus grace) has passed.
    async fn expired_leases(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Task>>;

    /// Refresh a lease deadline iff the owner still holds it.
    /// Returns `false` when the lease has been revoked or reassigned.
    async fn refresh_lease(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<bool>;

    /// Rewrite `manual_rank` for one task without touching anything else.
    async fn set_manual_rank(&self, id: Uuid, manual_rank: Option<i64>) -> DomainResult<()>;

    /// Pending tasks in one priority bucket ordered by manual rank, for
    /// reorder renumbering.
    async fn pending_bucket(&self, priority: i32) -> DomainResult<Vec<Task>>;

    /// Tasks within a pipeline, by step order.
    async fn list_by_pipeline(&self, pipeline_id: &str) -> DomainResult<Vec<Task>>;
}

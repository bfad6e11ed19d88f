//! Audit log port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::AuditEntry;

/// Append-only log of task mutations.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry. Entries are immutable once written.
    async fn append(&self, entry: &AuditEntry) -> DomainResult<()>;

    /// Entries for a task in commit order.
    async fn for_task(&self, task_id: Uuid) -> DomainResult<Vec<AuditEntry>>;

    /// Number of entries recorded for a task.
    async fn count_for_task(&self, task_id: Uuid) -> DomainResult<u64>;
}

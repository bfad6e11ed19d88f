//! Template, schedule-state, and approval ports.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Approval, ApprovalStatus, ScheduleState, TaskTemplate};

/// Persistence for task templates.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn upsert(&self, template: &TaskTemplate) -> DomainResult<()>;

    async fn get(&self, name: &str) -> DomainResult<Option<TaskTemplate>>;

    async fn list(&self) -> DomainResult<Vec<TaskTemplate>>;

    async fn delete(&self, name: &str) -> DomainResult<()>;
}

/// Persistence for scheduler firing state.
#[async_trait]
pub trait ScheduleStateRepository: Send + Sync {
    async fn get(&self, template_name: &str) -> DomainResult<Option<ScheduleState>>;

    async fn put(&self, state: &ScheduleState) -> DomainResult<()>;
}

/// Persistence for human approvals.
#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn create(&self, approval: &Approval) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Approval>>;

    async fn list_pending(&self) -> DomainResult<Vec<Approval>>;

    /// Record a verdict; no-op when already resolved.
    async fn resolve(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        feedback: Option<&str>,
    ) -> DomainResult<()>;
}

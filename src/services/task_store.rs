//! Task store: CRUD plus guarded, audited state transitions.
//!
//! This is the single write path for task rows. Every transition re-reads
//! the row, validates it against the state machine, persists the patched
//! row together with its audit entry under one transaction (compare-and-set
//! on `version`), and only then publishes the event.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::transition::{apply_transition, TransitionRequest};
use crate::domain::models::{AuditEntry, Task, TaskEvent, TaskStatus};
use crate::domain::ports::{TaskFilter, TaskRepository};
use crate::services::event_bus::EventBus;

/// Lost-race retries before surfacing `ConcurrencyError`.
const TRANSITION_RETRIES: u32 = 3;

/// Mutable fields accepted by [`TaskStore::update`].
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub summary: Option<String>,
    pub prompt: Option<String>,
    pub priority: Option<i32>,
    pub backend: Option<Option<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub max_attempts: Option<u32>,
    pub max_bounces: Option<u32>,
}

pub struct TaskStore {
    repo: Arc<dyn TaskRepository>,
    events: EventBus,
}

impl TaskStore {
    pub fn new(repo: Arc<dyn TaskRepository>, events: EventBus) -> Self {
        Self { repo, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    /// Persist a new task (status PENDING, counters zeroed) and publish
    /// the created event.
    pub async fn create(&self, task: Task, actor: &str) -> DomainResult<Task> {
        task.validate().map_err(DomainError::Validation)?;

        let audit = AuditEntry::created(&task, actor);
        self.repo.create_with_audit(&task, &audit).await?;

        tracing::info!(task_id = %task.id, task_type = %task.task_type, "task created");
        self.events.publish(TaskEvent::created(task.clone(), actor));
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<Task> {
        self.repo
            .get(id)
            .await?
            .ok_or(DomainError::TaskNotFound(id))
    }

    pub async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        self.repo.list(filter).await
    }

    /// Apply a field update outside the state machine. Status, counters,
    /// and lease fields are not touchable here.
    pub async fn update(&self, id: Uuid, update: TaskUpdate, actor: &str) -> DomainResult<Task> {
        for attempt in 0..TRANSITION_RETRIES {
            let before = self.get(id).await?;
            let mut after = before.clone();

            if let Some(summary) = update.summary.clone() {
                after.summary = summary;
            }
            if let Some(prompt) = update.prompt.clone() {
                after.prompt = prompt;
            }
            if let Some(priority) = update.priority {
                after.priority = priority;
            }
            if let Some(backend) = update.backend.clone() {
                after.backend = backend;
            }
            if let Some(metadata) = update.metadata.clone() {
                after.metadata = metadata;
            }
            if let Some(criteria) = update.acceptance_criteria.clone() {
                after.acceptance_criteria = criteria;
            }
            if let Some(max_attempts) = update.max_attempts {
                after.max_attempts = max_attempts;
            }
            if let Some(max_bounces) = update.max_bounces {
                after.max_bounces = max_bounces;
            }
            after.updated_at = chrono::Utc::now();
            after.version = before.version + 1;

            let audit = AuditEntry::updated(&before, &after, actor);
            if self.repo.update_with_audit(&after, before.version, &audit).await? {
                self.events.publish(TaskEvent::updated(after.clone(), actor));
                return Ok(after);
            }
            tracing::debug!(task_id = %id, attempt, "update lost version race, retrying");
        }
        Err(DomainError::Concurrency(id))
    }

    /// Atomically drive a task through the state machine.
    ///
    /// Guard failures surface as `TransitionError`; losing the version race
    /// retries against the fresh row up to 3 times, then fails with
    /// `ConcurrencyError`. The transition event fires after commit.
    pub async fn transition(
        &self,
        id: Uuid,
        to: TaskStatus,
        request: TransitionRequest,
        actor: &str,
    ) -> DomainResult<Task> {
        for attempt in 0..TRANSITION_RETRIES {
            let before = self.get(id).await?;
            let from = before.status;

            let patch = apply_transition(&before, to, &request, actor)?;
            let mut after = before.clone();
            patch.apply_to(&mut after);

            debug_assert!(after.lease_consistent(), "transition broke lease invariant");

            let audit = AuditEntry::transitioned(&before, &after, actor);
            if self.repo.update_with_audit(&after, before.version, &audit).await? {
                tracing::info!(
                    task_id = %id,
                    from = from.as_str(),
                    to = to.as_str(),
                    actor,
                    "task transitioned"
                );
                self.events
                    .publish(TaskEvent::transitioned(after.clone(), from, to, actor));
                return Ok(after);
            }
            tracing::debug!(task_id = %id, attempt, "transition lost version race, retrying");
        }
        Err(DomainError::Concurrency(id))
    }

    /// Release a lease if (and only if) `owner` still holds it, returning
    /// the task to PENDING. Used by the dispatcher on abort paths.
    pub async fn release(&self, id: Uuid, owner: &str) -> DomainResult<Option<Task>> {
        let task = self.get(id).await?;
        if task.status != TaskStatus::InProgress || task.lease_owner.as_deref() != Some(owner) {
            return Ok(None);
        }
        let released = self
            .transition(
                id,
                TaskStatus::Pending,
                TransitionRequest::error(format!("released by {owner}")),
                owner,
            )
            .await?;
        Ok(Some(released))
    }

    /// Verify that the given owner still holds the task's lease; used by
    /// adapters before they attempt a completion transition.
    pub async fn check_lease(&self, id: Uuid, owner: &str) -> DomainResult<()> {
        let task = self.get(id).await?;
        if task.status == TaskStatus::InProgress && task.lease_owner.as_deref() == Some(owner) {
            Ok(())
        } else {
            Err(DomainError::LeaseExpired {
                task_id: id,
                owner: owner.to_string(),
            })
        }
    }
}

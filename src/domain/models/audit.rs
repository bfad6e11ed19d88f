//! Audit log entries.
//!
//! One immutable row per accepted transition (and per create/update), keyed
//! by task id with monotonic timestamps. Replaying a task's entries
//! reproduces its current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::task::Task;

/// An append-only record of a task mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Source state, or "none" for creation
    pub from_state: String,
    /// Target state, or the row's state for non-transition updates
    pub to_state: String,
    /// Who drove the mutation: "dispatcher", "watchdog", adapter name, ...
    pub actor: String,
    /// Full row snapshot before the mutation (null for creation)
    pub before_json: Option<String>,
    /// Full row snapshot after the mutation
    pub after_json: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry for a freshly created task.
    pub fn created(task: &Task, actor: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id: task.id,
            from_state: "none".to_string(),
            to_state: task.status.as_str().to_string(),
            actor: actor.to_string(),
            before_json: None,
            after_json: serde_json::to_string(task).unwrap_or_default(),
            created_at: Utc::now(),
        }
    }

    /// Entry for an accepted state transition.
    pub fn transitioned(before: &Task, after: &Task, actor: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id: after.id,
            from_state: before.status.as_str().to_string(),
            to_state: after.status.as_str().to_string(),
            actor: actor.to_string(),
            before_json: serde_json::to_string(before).ok(),
            after_json: serde_json::to_string(after).unwrap_or_default(),
            created_at: Utc::now(),
        }
    }

    /// Entry for a non-transition field update.
    pub fn updated(before: &Task, after: &Task, actor: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id: after.id,
            from_state: before.status.as_str().to_string(),
            to_state: after.status.as_str().to_string(),
            actor: actor.to_string(),
            before_json: serde_json::to_string(before).ok(),
            after_json: serde_json::to_string(after).unwrap_or_default(),
            created_at: Utc::now(),
        }
    }

    /// Deserialize the post-mutation snapshot.
    pub fn after_snapshot(&self) -> Option<Task> {
        serde_json::from_str(&self.after_json).ok()
    }
}

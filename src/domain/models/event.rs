//! Post-commit task events and webhook payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::task::{Task, TaskStatus};

/// What happened to the task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Transitioned,
    Updated,
}

/// Fired by the task store after a commit; subscribers never observe
/// uncommitted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    /// Read-only snapshot of the committed row
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<TaskStatus>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn created(task: Task, actor: &str) -> Self {
        Self {
            event: TaskEventKind::Created,
            task,
            from_state: None,
            to_state: None,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn transitioned(task: Task, from: TaskStatus, to: TaskStatus, actor: &str) -> Self {
        Self {
            event: TaskEventKind::Transitioned,
            task,
            from_state: Some(from),
            to_state: Some(to),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn updated(task: Task, actor: &str) -> Self {
        Self {
            event: TaskEventKind::Updated,
            task,
            from_state: None,
            to_state: None,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Outward-facing event category for webhook subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    Review,
    Blocked,
    Done,
    PipelineComplete,
}

/// Payload POSTed to webhook subscribers. Timestamps are ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: WebhookEventKind,
    pub task_id: Uuid,
    pub task_summary: String,
    pub task_type: String,
    pub task_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    /// "done/total" within the pipeline, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_progress: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn from_task(kind: WebhookEventKind, task: &Task) -> Self {
        Self {
            event: kind,
            task_id: task.id,
            task_summary: task.summary.clone(),
            task_type: task.task_type.clone(),
            task_status: task.status,
            pipeline_id: task.pipeline_id.clone(),
            pipeline_progress: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_payload_serializes_iso8601() {
        let task = Task::new("chat", "hi");
        let event = WebhookEvent::from_task(WebhookEventKind::Done, &task);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "done");
        let ts = json["timestamp"].as_str().unwrap();
        assert!(ts.contains('T'), "expected ISO-8601 timestamp, got {ts}");
    }
}

//! Task templates, schedule state, and human approvals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::task::{BackendConfig, Task};

/// A task blueprint inside a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTask {
    pub task_type: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub backend_config: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A named set of task blueprints the scheduler can instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tasks: Vec<TemplateTask>,
}

impl TaskTemplate {
    /// Validate the template before persisting or firing.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("template name cannot be empty".to_string());
        }
        if self.tasks.is_empty() {
            return Err("template must contain at least one task".to_string());
        }
        for (idx, spec) in self.tasks.iter().enumerate() {
            if spec.task_type.trim().is_empty() || spec.prompt.trim().is_empty() {
                return Err(format!("template task {idx} is missing task_type or prompt"));
            }
        }
        Ok(())
    }

    /// Materialize the template into pending tasks.
    pub fn instantiate(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|spec| {
                let mut task = Task::new(&spec.task_type, &spec.prompt)
                    .with_priority(spec.priority)
                    .with_backend_config(spec.backend_config.clone());
                if let Some(summary) = &spec.summary {
                    task.summary = summary.clone();
                }
                task.backend = spec.backend.clone();
                task.acceptance_criteria = spec.acceptance_criteria.clone();
                if let Some(metadata) = &spec.metadata {
                    task.metadata = metadata.clone();
                }
                task.metadata.insert(
                    "template".to_string(),
                    serde_json::Value::String(self.name.clone()),
                );
                task
            })
            .collect()
    }
}

/// Persisted firing state for one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub template_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Resolution state of a human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A pending human verdict on a task in review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            status: ApprovalStatus::Pending,
            feedback: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

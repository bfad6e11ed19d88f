//! Task domain model.
//!
//! Tasks are discrete units of work dispatched to execution adapters.
//! Their lifecycle is driven by a guarded state machine; the lease fields
//! are populated exactly while a task is in progress.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for the dispatcher
    Pending,
    /// Leased to an adapter and executing
    InProgress,
    /// Execution finished, awaiting verdict
    Review,
    /// Accepted; terminal
    Done,
    /// Needs operator attention; only exits via explicit unblock
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" | "in-progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Valid transition targets from this status.
    ///
    /// Membership here is necessary but not sufficient: each pair also has
    /// guards evaluated by [`validate_transition`](super::transition::validate_transition).
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Blocked],
            Self::InProgress => &[Self::Review, Self::Pending, Self::Blocked],
            Self::Review => &[Self::Done, Self::Pending, Self::Blocked],
            Self::Blocked => &[Self::Pending],
            Self::Done => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Adapter invocation settings carried by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Command to run (shell adapters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for the command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Model selector (LLM adapters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-invocation timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A single entry in a task's feedback history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// Who produced the feedback (reviewer name, "gate", "human", ...)
    pub actor: String,
    /// The compiled feedback text
    pub feedback: String,
    /// When it was recorded
    pub created_at: DateTime<Utc>,
}

/// A discrete unit of work dispatched to an execution adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUIDv7: monotonic, lexicographically sortable)
    pub id: Uuid,
    /// Free-form work classification, matched by adapters ("code", "chat", ...)
    pub task_type: String,
    /// Adapter selector hint; exact name or "name/variant"
    pub backend: Option<String>,
    /// Queue priority; lower is more urgent
    pub priority: i32,
    /// Manual tie-break within a priority bucket; null sorts after non-null
    pub manual_rank: Option<i64>,
    /// One-line summary
    pub summary: String,
    /// Full prompt / instructions
    pub prompt: String,
    /// Criteria the result is reviewed against
    pub acceptance_criteria: Vec<String>,
    /// Checklist for completion
    pub definition_of_done: Vec<String>,
    /// Adapter invocation settings
    pub backend_config: BackendConfig,
    /// Current lifecycle state
    pub status: TaskStatus,
    /// Executions returned to the queue so far
    pub attempt_count: u32,
    /// Execution ceiling
    pub max_attempts: u32,
    /// Review bounces so far
    pub bounce_count: u32,
    /// Bounce ceiling
    pub max_bounces: u32,
    /// Lease holder; set iff status is InProgress
    pub lease_owner: Option<String>,
    /// Lease deadline; set iff status is InProgress
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Adapter output accepted into review
    pub result: Option<String>,
    /// Pointer to evidence (diff, artifact path, URL)
    pub evidence_ref: Option<String>,
    /// Last execution failure
    pub last_error: Option<String>,
    /// Accumulated reviewer/gate feedback
    pub feedback_history: Vec<FeedbackEntry>,
    /// Pipeline this task belongs to
    pub pipeline_id: Option<String>,
    /// Step index within the pipeline
    pub pipeline_step: Option<i64>,
    /// Task IDs that must be Done before this one dispatches
    pub depends_on: Vec<Uuid>,
    /// Parent task (review/fix children)
    pub parent_task_id: Option<Uuid>,
    /// Free-form metadata (review strategy, gates, retry policy, ...)
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// Version for optimistic locking
    pub version: i64,
}

impl Task {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_MAX_BOUNCES: u32 = 3;

    /// Create a new pending task from a prompt. Summary is auto-generated.
    pub fn new(task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let summary = generate_summary(&prompt);
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_type: task_type.into(),
            backend: None,
            priority: 0,
            manual_rank: None,
            summary,
            prompt,
            acceptance_criteria: Vec::new(),
            definition_of_done: Vec::new(),
            backend_config: BackendConfig::default(),
            status: TaskStatus::default(),
            attempt_count: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            bounce_count: 0,
            max_bounces: Self::DEFAULT_MAX_BOUNCES,
            lease_owner: None,
            lease_expires_at: None,
            result: None,
            evidence_ref: None,
            last_error: None,
            feedback_history: Vec::new(),
            pipeline_id: None,
            pipeline_step: None,
            depends_on: Vec::new(),
            parent_task_id: None,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Set an explicit summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the backend selector hint.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Set priority (lower is more urgent).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    /// Set parent task.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_id);
        self
    }

    /// Set pipeline membership.
    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>, step: i64) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self.pipeline_step = Some(step);
        self
    }

    /// Set the execution ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set backend invocation settings.
    pub fn with_backend_config(mut self, config: BackendConfig) -> Self {
        self.backend_config = config;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check if task is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another execution may be attempted after a failure.
    ///
    /// `attempt_count` only increments when a lease is returned, so a task
    /// currently executing has `attempt_count + 1` attempts in flight.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count + 1 < self.max_attempts
    }

    /// Whether the task may be bounced from review back to the queue.
    pub fn has_bounces_left(&self) -> bool {
        self.bounce_count < self.max_bounces
    }

    /// Validate structural integrity.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_type.trim().is_empty() {
            return Err("task_type cannot be empty".to_string());
        }
        if self.prompt.trim().is_empty() {
            return Err("prompt cannot be empty".to_string());
        }
        if self.depends_on.contains(&self.id) {
            return Err("task cannot depend on itself".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Lease-field/state consistency: lease iff in progress.
    pub fn lease_consistent(&self) -> bool {
        match self.status {
            TaskStatus::InProgress => self.lease_owner.is_some() && self.lease_expires_at.is_some(),
            _ => self.lease_owner.is_none() && self.lease_expires_at.is_none(),
        }
    }
}

/// Generate a short summary from a prompt string.
/// Takes the first line, truncates at ~80 chars on a word boundary.
fn generate_summary(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt).trim();
    if first_line.is_empty() {
        return "Untitled task".to_string();
    }
    let max_len = 80;
    if first_line.len() <= max_len {
        return first_line.to_string();
    }
    match first_line[..max_len].rfind(' ') {
        Some(pos) => format!("{}...", &first_line[..pos]),
        None => format!("{}...", &first_line[..max_len]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("chat", "Say hello to the user");
        assert_eq!(task.summary, "Say hello to the user");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_attempts, 5);
        assert_eq!(task.max_bounces, 3);
        assert!(task.lease_consistent());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = Task::new("chat", "first");
        let b = Task::new("chat", "second");
        assert!(a.id.to_string() < b.id.to_string());
    }

    #[test]
    fn test_generate_summary() {
        assert_eq!(generate_summary("Short prompt"), "Short prompt");
        assert_eq!(generate_summary("First line\nSecond line"), "First line");

        let long = "This is a very long prompt that exceeds eighty characters and should be truncated at a word boundary somewhere";
        let summary = generate_summary(long);
        assert!(summary.len() <= 84);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_valid_transition_targets() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Blocked));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Review));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Done));

        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Review));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Blocked));

        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Blocked));

        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Pending));

        assert!(TaskStatus::Done.valid_transitions().is_empty());
        assert!(TaskStatus::Done.is_terminal());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let task = Task::new("code", "Do the thing");
        let id = task.id;
        let task = task.with_dependency(id);
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(Task::new("code", "  ").validate().is_err());
        assert!(Task::new(" ", "prompt").validate().is_err());
        assert!(Task::new("code", "prompt").validate().is_ok());

        let mut task = Task::new("code", "prompt");
        task.max_attempts = 0;
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_attempts_left() {
        let mut task = Task::new("code", "prompt");
        task.max_attempts = 2;
        assert!(task.has_attempts_left());
        task.attempt_count = 1;
        assert!(!task.has_attempts_left());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Blocked,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }
}

//! Task state machine: transition guards and patches.
//!
//! [`can_transition`] is a pure predicate, [`validate_transition`] surfaces
//! the failed guard, and [`apply_transition`] returns the patch the store
//! persists. Nothing here touches the database; the store re-reads the row
//! under its transaction and calls these on the fresh copy.

use chrono::{DateTime, Utc};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::task::{FeedbackEntry, Task, TaskStatus};

/// Caller-supplied context for a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionRequest {
    /// Lease holder for PENDING→IN_PROGRESS
    pub lease_owner: Option<String>,
    /// Lease deadline for PENDING→IN_PROGRESS
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Adapter output for IN_PROGRESS→REVIEW
    pub result: Option<String>,
    /// Evidence pointer for IN_PROGRESS→REVIEW
    pub evidence_ref: Option<String>,
    /// Bounce feedback for REVIEW→PENDING
    pub feedback: Option<String>,
    /// Failure detail for IN_PROGRESS→{PENDING, BLOCKED}
    pub error: Option<String>,
}

impl TransitionRequest {
    pub fn lease(owner: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            lease_owner: Some(owner.into()),
            lease_expires_at: Some(expires_at),
            ..Default::default()
        }
    }

    pub fn result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn feedback(feedback: impl Into<String>) -> Self {
        Self {
            feedback: Some(feedback.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Field changes produced by an accepted transition.
///
/// `None` means "leave unchanged"; the nested option on lease fields
/// distinguishes clearing from leaving alone.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub lease_owner: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub attempt_count: Option<u32>,
    pub bounce_count: Option<u32>,
    pub result: Option<String>,
    pub evidence_ref: Option<String>,
    pub last_error: Option<String>,
    pub push_feedback: Option<FeedbackEntry>,
}

impl TaskPatch {
    /// Apply this patch to a task in place, bumping `updated_at` and `version`.
    pub fn apply_to(self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(owner) = self.lease_owner {
            task.lease_owner = owner;
        }
        if let Some(expires) = self.lease_expires_at {
            task.lease_expires_at = expires;
        }
        if let Some(count) = self.attempt_count {
            task.attempt_count = count;
        }
        if let Some(count) = self.bounce_count {
            task.bounce_count = count;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(evidence) = self.evidence_ref {
            task.evidence_ref = Some(evidence);
        }
        if let Some(error) = self.last_error {
            task.last_error = Some(error);
        }
        if let Some(entry) = self.push_feedback {
            task.feedback_history.push(entry);
        }
        task.updated_at = Utc::now();
        task.version += 1;
    }
}

/// Pure predicate: would this transition be accepted?
pub fn can_transition(task: &Task, to: TaskStatus, request: &TransitionRequest) -> bool {
    validate_transition(task, to, request).is_ok()
}

/// Check the transition pair and its guards; error names the failed guard.
pub fn validate_transition(task: &Task, to: TaskStatus, request: &TransitionRequest) -> DomainResult<()> {
    let from = task.status;
    let reject = |reason: &str| {
        Err(DomainError::Transition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.to_string(),
        })
    };

    if !from.can_transition_to(to) {
        return reject("transition pair not allowed");
    }

    match (from, to) {
        (TaskStatus::Pending, TaskStatus::InProgress) => {
            if request.lease_owner.is_none() {
                return reject("lease_owner is required");
            }
            if request.lease_expires_at.is_none() {
                return reject("lease_expires_at is required");
            }
        }
        (TaskStatus::InProgress, TaskStatus::Review) => {
            if request.result.is_none() && request.evidence_ref.is_none() {
                return reject("result or evidence_ref is required");
            }
        }
        (TaskStatus::InProgress, TaskStatus::Pending) => {
            if task.attempt_count >= task.max_attempts {
                return reject("attempt_count is at max_attempts");
            }
        }
        (TaskStatus::Review, TaskStatus::Pending) => {
            if request.feedback.is_none() {
                return reject("feedback is required");
            }
            if task.bounce_count >= task.max_bounces {
                return reject("bounce_count is at max_bounces");
            }
        }
        _ => {}
    }

    Ok(())
}

/// Validate and produce the patch for a transition.
///
/// `actor` is recorded on appended feedback entries.
pub fn apply_transition(
    task: &Task,
    to: TaskStatus,
    request: &TransitionRequest,
    actor: &str,
) -> DomainResult<TaskPatch> {
    validate_transition(task, to, request)?;

    let mut patch = TaskPatch {
        status: Some(to),
        ..Default::default()
    };

    match (task.status, to) {
        (TaskStatus::Pending, TaskStatus::InProgress) => {
            patch.lease_owner = Some(request.lease_owner.clone());
            patch.lease_expires_at = Some(request.lease_expires_at);
        }
        (TaskStatus::InProgress, TaskStatus::Review) => {
            patch.lease_owner = Some(None);
            patch.lease_expires_at = Some(None);
            patch.result = request.result.clone();
            patch.evidence_ref = request.evidence_ref.clone();
        }
        (TaskStatus::InProgress, TaskStatus::Pending) => {
            patch.lease_owner = Some(None);
            patch.lease_expires_at = Some(None);
            patch.attempt_count = Some(task.attempt_count + 1);
            patch.last_error = request.error.clone();
        }
        (TaskStatus::InProgress, TaskStatus::Blocked) => {
            patch.lease_owner = Some(None);
            patch.lease_expires_at = Some(None);
            patch.last_error = request.error.clone();
        }
        (TaskStatus::Review, TaskStatus::Pending) => {
            patch.bounce_count = Some(task.bounce_count + 1);
            patch.push_feedback = request.feedback.clone().map(|feedback| FeedbackEntry {
                actor: actor.to_string(),
                feedback,
                created_at: Utc::now(),
            });
        }
        _ => {}
    }

    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease_request() -> TransitionRequest {
        TransitionRequest::lease("worker-a", Utc::now() + Duration::seconds(60))
    }

    fn in_progress_task() -> Task {
        let mut task = Task::new("code", "do something");
        let patch = apply_transition(&task, TaskStatus::InProgress, &lease_request(), "dispatcher").unwrap();
        patch.apply_to(&mut task);
        task
    }

    #[test]
    fn lease_guard_requires_owner() {
        let task = Task::new("code", "p");
        let err = validate_transition(&task, TaskStatus::InProgress, &TransitionRequest::default())
            .unwrap_err();
        assert!(err.to_string().contains("lease_owner"));
        assert!(can_transition(&task, TaskStatus::InProgress, &lease_request()));
    }

    #[test]
    fn lease_fields_set_and_cleared() {
        let task = in_progress_task();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.lease_owner.as_deref(), Some("worker-a"));
        assert!(task.lease_expires_at.is_some());
        assert!(task.lease_consistent());

        let mut task = task;
        let patch = apply_transition(
            &task,
            TaskStatus::Review,
            &TransitionRequest::result("output"),
            "worker-a",
        )
        .unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.status, TaskStatus::Review);
        assert!(task.lease_owner.is_none());
        assert!(task.lease_expires_at.is_none());
        assert_eq!(task.result.as_deref(), Some("output"));
        assert!(task.lease_consistent());
    }

    #[test]
    fn review_requires_result_or_evidence() {
        let task = in_progress_task();
        assert!(validate_transition(&task, TaskStatus::Review, &TransitionRequest::default()).is_err());

        let with_evidence = TransitionRequest {
            evidence_ref: Some("diff://abc".to_string()),
            ..Default::default()
        };
        assert!(validate_transition(&task, TaskStatus::Review, &with_evidence).is_ok());
    }

    #[test]
    fn requeue_increments_attempts() {
        let mut task = in_progress_task();
        let patch = apply_transition(
            &task,
            TaskStatus::Pending,
            &TransitionRequest::error("boom"),
            "dispatcher",
        )
        .unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.attempt_count, 1);
        assert!(task.lease_owner.is_none());
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn requeue_rejected_at_attempt_ceiling() {
        let mut task = in_progress_task();
        task.attempt_count = task.max_attempts;
        assert!(validate_transition(&task, TaskStatus::Pending, &TransitionRequest::default()).is_err());
    }

    #[test]
    fn bounce_appends_feedback_and_counts() {
        let mut task = in_progress_task();
        let patch = apply_transition(&task, TaskStatus::Review, &TransitionRequest::result("out"), "w").unwrap();
        patch.apply_to(&mut task);

        let patch = apply_transition(
            &task,
            TaskStatus::Pending,
            &TransitionRequest::feedback("needs more detail"),
            "reviewer",
        )
        .unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.bounce_count, 1);
        assert_eq!(task.feedback_history.len(), 1);
        assert_eq!(task.feedback_history[0].actor, "reviewer");
        assert_eq!(task.feedback_history[0].feedback, "needs more detail");
        // A bounce does not consume an execution attempt.
        assert_eq!(task.attempt_count, 0);
    }

    #[test]
    fn bounce_rejected_without_feedback_or_at_ceiling() {
        let mut task = in_progress_task();
        let patch = apply_transition(&task, TaskStatus::Review, &TransitionRequest::result("out"), "w").unwrap();
        patch.apply_to(&mut task);

        assert!(validate_transition(&task, TaskStatus::Pending, &TransitionRequest::default()).is_err());

        task.bounce_count = task.max_bounces;
        assert!(validate_transition(
            &task,
            TaskStatus::Pending,
            &TransitionRequest::feedback("f")
        )
        .is_err());
    }

    #[test]
    fn done_is_terminal() {
        let mut task = in_progress_task();
        let patch = apply_transition(&task, TaskStatus::Review, &TransitionRequest::result("out"), "w").unwrap();
        patch.apply_to(&mut task);
        let patch = apply_transition(&task, TaskStatus::Done, &TransitionRequest::default(), "human").unwrap();
        patch.apply_to(&mut task);
        assert!(task.is_terminal());

        for to in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Blocked,
        ] {
            assert!(validate_transition(&task, to, &TransitionRequest::default()).is_err());
        }
    }

    #[test]
    fn blocked_only_exits_to_pending() {
        let mut task = Task::new("code", "p");
        let patch = apply_transition(&task, TaskStatus::Blocked, &TransitionRequest::default(), "op").unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.status, TaskStatus::Blocked);

        assert!(validate_transition(&task, TaskStatus::InProgress, &lease_request()).is_err());
        assert!(validate_transition(&task, TaskStatus::Pending, &TransitionRequest::default()).is_ok());
    }

    #[test]
    fn version_bumps_on_apply() {
        let mut task = Task::new("code", "p");
        let before = task.version;
        let patch = apply_transition(&task, TaskStatus::Blocked, &TransitionRequest::default(), "op").unwrap();
        patch.apply_to(&mut task);
        assert_eq!(task.version, before + 1);
    }
}

//! Review handler: turns REVIEW/DONE transition events into critique
//! children, human approvals, and parent resolutions.
//!
//! Subscribes to the post-commit event stream. Tasks opt in through the
//! `review` metadata key:
//!
//! ```json
//! {"review": {"mode": "llm", "on_fix_done": "done"}}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::transition::TransitionRequest;
use crate::domain::models::{Approval, ApprovalStatus, Task, TaskEvent, TaskEventKind, TaskStatus};
use crate::domain::ports::ApprovalRepository;
use crate::services::task_store::TaskStore;

const ACTOR: &str = "review";
const ROLE_KEY: &str = "review_role";

/// Who produces the verdict for a task in review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Spawn an LLM critique child task
    Llm,
    /// Park a pending approval row for a human
    Human,
}

/// How to resolve the parent once a fix child completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixResolution {
    Done,
    Pending,
}

impl Default for FixResolution {
    fn default() -> Self {
        Self::Done
    }
}

/// Parsed review strategy from task metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStrategy {
    pub mode: ReviewMode,
    #[serde(default)]
    pub on_fix_done: FixResolution,
}

impl ReviewStrategy {
    pub fn of(task: &Task) -> Option<Self> {
        task.metadata
            .get("review")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Structured verdict expected in a critic child's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub verdict: Verdict,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Bounce,
    Fix,
}

pub struct ReviewHandler {
    store: Arc<TaskStore>,
    approvals: Arc<dyn ApprovalRepository>,
}

impl ReviewHandler {
    pub fn new(store: Arc<TaskStore>, approvals: Arc<dyn ApprovalRepository>) -> Self {
        Self { store, approvals }
    }

    /// Consume events until the bus closes. Handling failures are logged;
    /// the stream is never dropped over one bad event.
    pub async fn run(&self) {
        let mut events = self.store.events().subscribe();
        tracing::info!("review handler started");
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle(&event).await {
                        tracing::error!(task_id = %event.task.id, "review handling failed: {e}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "review handler lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("review handler stopped");
    }

    pub async fn handle(&self, event: &TaskEvent) -> DomainResult<()> {
        if event.event != TaskEventKind::Transitioned {
            return Ok(());
        }
        match event.to_state {
            Some(TaskStatus::Review) => self.on_entered_review(&event.task).await,
            Some(TaskStatus::Done) => self.on_task_done(&event.task).await,
            _ => Ok(()),
        }
    }

    /// A task entered review: synthesize the reviewer its strategy asks for.
    async fn on_entered_review(&self, task: &Task) -> DomainResult<()> {
        // Review and fix children resolve through their parent, never
        // recursively.
        if task.metadata.contains_key(ROLE_KEY) {
            return Ok(());
        }
        let Some(strategy) = ReviewStrategy::of(task) else {
            return Ok(());
        };

        match strategy.mode {
            ReviewMode::Llm => {
                let child = critic_task(task);
                self.store.create(child, ACTOR).await?;
                tracing::info!(parent = %task.id, "critique child created");
            }
            ReviewMode::Human => {
                let approval = Approval::new(task.id);
                self.approvals.create(&approval).await?;
                tracing::info!(parent = %task.id, approval = %approval.id, "approval created");
            }
        }
        Ok(())
    }

    /// A child finished: resolve its parent according to the child's role.
    async fn on_task_done(&self, task: &Task) -> DomainResult<()> {
        let Some(parent_id) = task.parent_task_id else {
            return Ok(());
        };
        let role = task.metadata.get(ROLE_KEY).and_then(|v| v.as_str());
        match role {
            Some("critic") => self.resolve_critic_verdict(parent_id, task).await,
            Some("fix") => self.resolve_fix_completion(parent_id, task).await,
            _ => Ok(()),
        }
    }

    async fn resolve_critic_verdict(&self, parent_id: Uuid, child: &Task) -> DomainResult<()> {
        let outcome = parse_outcome(child);
        let parent = self.store.get(parent_id).await?;
        if parent.status != TaskStatus::Review {
            tracing::warn!(parent = %parent_id, status = parent.status.as_str(), "verdict arrived for a task not in review");
            return Ok(());
        }

        match outcome.verdict {
            Verdict::Approve => {
                self.store
                    .transition(parent_id, TaskStatus::Done, TransitionRequest::default(), ACTOR)
                    .await?;
            }
            Verdict::Bounce => {
                let feedback = outcome
                    .feedback
                    .unwrap_or_else(|| "Reviewer requested changes.".to_string());
                self.bounce_or_block(parent_id, feedback).await?;
            }
            Verdict::Fix => {
                let fix = fix_task(&parent, outcome.feedback.as_deref());
                self.store.create(fix, ACTOR).await?;
                tracing::info!(parent = %parent_id, "fix child created");
            }
        }
        Ok(())
    }

    async fn resolve_fix_completion(&self, parent_id: Uuid, _child: &Task) -> DomainResult<()> {
        let parent = self.store.get(parent_id).await?;
        if parent.status != TaskStatus::Review {
            return Ok(());
        }
        let resolution = ReviewStrategy::of(&parent)
            .map(|s| s.on_fix_done)
            .unwrap_or_default();

        match resolution {
            FixResolution::Done => {
                self.store
                    .transition(parent_id, TaskStatus::Done, TransitionRequest::default(), ACTOR)
                    .await?;
            }
            FixResolution::Pending => {
                self.bounce_or_block(parent_id, "Fix applied; please re-verify.".to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// Resolve a pending human approval, driving the parent transition.
    pub async fn resolve_approval(
        &self,
        approval_id: Uuid,
        approved: bool,
        feedback: Option<String>,
    ) -> DomainResult<()> {
        let approval = self
            .approvals
            .get(approval_id)
            .await?
            .ok_or_else(|| DomainError::Validation(format!("approval {approval_id} not found")))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(DomainError::Validation(format!(
                "approval {approval_id} is already {}",
                approval.status.as_str()
            )));
        }

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.approvals
            .resolve(approval_id, status, feedback.as_deref())
            .await?;

        if approved {
            self.store
                .transition(approval.task_id, TaskStatus::Done, TransitionRequest::default(), "human")
                .await?;
        } else {
            let feedback = feedback.unwrap_or_else(|| "Rejected by reviewer.".to_string());
            self.bounce_or_block(approval.task_id, feedback).await?;
        }
        Ok(())
    }

    /// Bounce the parent back to the queue; at the bounce ceiling the task
    /// is blocked for operator attention instead.
    async fn bounce_or_block(&self, parent_id: Uuid, feedback: String) -> DomainResult<()> {
        let result = self
            .store
            .transition(
                parent_id,
                TaskStatus::Pending,
                TransitionRequest::feedback(feedback.clone()),
                ACTOR,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(DomainError::Transition { .. }) => {
                tracing::warn!(parent = %parent_id, "bounce rejected, blocking task");
                self.store
                    .transition(
                        parent_id,
                        TaskStatus::Blocked,
                        TransitionRequest::error(format!("bounce budget exhausted: {feedback}")),
                        ACTOR,
                    )
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Build the LLM critique child for a task in review.
fn critic_task(parent: &Task) -> Task {
    let criteria = if parent.acceptance_criteria.is_empty() {
        "- The result addresses the prompt completely.".to_string()
    } else {
        parent
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let prompt = format!(
        "Review the result of the task below against its acceptance criteria.\n\
         Respond with JSON: {{\"verdict\": \"approve\"|\"bounce\"|\"fix\", \"feedback\": \"...\"}}.\n\n\
         ## Task\n{}\n\n## Acceptance criteria\n{}\n\n## Result\n{}",
        parent.prompt,
        criteria,
        parent.result.as_deref().unwrap_or("(no result recorded)"),
    );

    Task::new("review", prompt)
        .with_summary(format!("Review: {}", parent.summary))
        .with_parent(parent.id)
        .with_priority(parent.priority)
        .with_metadata(ROLE_KEY, serde_json::Value::String("critic".to_string()))
}

/// Build the fix child a critic asked for.
fn fix_task(parent: &Task, feedback: Option<&str>) -> Task {
    let prompt = format!(
        "Apply the reviewer's requested fixes to the previous result.\n\n\
         ## Original task\n{}\n\n## Previous result\n{}\n\n## Requested fixes\n{}",
        parent.prompt,
        parent.result.as_deref().unwrap_or("(no result recorded)"),
        feedback.unwrap_or("(none given)"),
    );

    Task::new(parent.task_type.clone(), prompt)
        .with_summary(format!("Fix: {}", parent.summary))
        .with_parent(parent.id)
        .with_priority(parent.priority)
        .with_backend_config(parent.backend_config.clone())
        .with_metadata(ROLE_KEY, serde_json::Value::String("fix".to_string()))
}

/// Parse the critic's structured verdict; unparseable output bounces with
/// the raw text as feedback.
fn parse_outcome(child: &Task) -> ReviewOutcome {
    child
        .result
        .as_deref()
        .and_then(|raw| serde_json::from_str::<ReviewOutcome>(raw.trim()).ok())
        .unwrap_or_else(|| ReviewOutcome {
            verdict: Verdict::Bounce,
            feedback: child
                .result
                .clone()
                .or_else(|| Some("Reviewer produced no verdict.".to_string())),
        })
}

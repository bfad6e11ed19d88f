mod common;

use std::sync::Arc;

use chrono::Utc;
use foreman::domain::models::{Task, TaskEvent, TaskStatus, TransitionRequest};
use foreman::domain::ports::{ApprovalRepository, TaskFilter};
use foreman::services::ReviewHandler;

use common::{setup, TestHarness};

fn handler(h: &TestHarness) -> ReviewHandler {
    ReviewHandler::new(Arc::clone(&h.store), h.approval_repo.clone())
}

/// Drive a task to REVIEW and return the transition event.
async fn drive_to_review(h: &TestHarness, task: &Task) -> TaskEvent {
    h.store
        .transition(
            task.id,
            TaskStatus::InProgress,
            TransitionRequest::lease("w", Utc::now() + chrono::Duration::seconds(60)),
            "d",
        )
        .await
        .unwrap();
    let reviewed = h
        .store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("the result"), "w")
        .await
        .unwrap();
    TaskEvent::transitioned(reviewed, TaskStatus::InProgress, TaskStatus::Review, "w")
}

/// Complete a child task and return the DONE event.
async fn complete_child(h: &TestHarness, child: &Task, result: &str) -> TaskEvent {
    h.store
        .transition(
            child.id,
            TaskStatus::InProgress,
            TransitionRequest::lease("w", Utc::now() + chrono::Duration::seconds(60)),
            "d",
        )
        .await
        .unwrap();
    h.store
        .transition(child.id, TaskStatus::Review, TransitionRequest::result(result), "w")
        .await
        .unwrap();
    let done = h
        .store
        .transition(child.id, TaskStatus::Done, TransitionRequest::default(), "review")
        .await
        .unwrap();
    TaskEvent::transitioned(done, TaskStatus::Review, TaskStatus::Done, "review")
}

async fn review_children(h: &TestHarness, parent: &Task) -> Vec<Task> {
    h.store
        .list(TaskFilter {
            parent_task_id: Some(parent.id),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn llm_strategy_spawns_critic_child() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "write a parser")
                .with_metadata("review", serde_json::json!({"mode": "llm"})),
            "test",
        )
        .await
        .unwrap();

    let event = drive_to_review(&h, &parent).await;
    handler.handle(&event).await.unwrap();

    let children = review_children(&h, &parent).await;
    assert_eq!(children.len(), 1);
    let critic = &children[0];
    assert_eq!(critic.task_type, "review");
    assert_eq!(critic.status, TaskStatus::Pending);
    assert!(critic.prompt.contains("the result"));
    assert_eq!(
        critic.metadata.get("review_role").and_then(|v| v.as_str()),
        Some("critic")
    );
}

#[tokio::test]
async fn tasks_without_strategy_are_ignored() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h.store.create(Task::new("code", "p"), "test").await.unwrap();

    let event = drive_to_review(&h, &parent).await;
    handler.handle(&event).await.unwrap();

    assert!(review_children(&h, &parent).await.is_empty());
    assert!(h.approval_repo.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn approve_verdict_completes_parent() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p").with_metadata("review", serde_json::json!({"mode": "llm"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let critic = review_children(&h, &parent).await.remove(0);
    let event = complete_child(&h, &critic, r#"{"verdict": "approve"}"#).await;
    handler.handle(&event).await.unwrap();

    assert_eq!(h.store.get(parent.id).await.unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn bounce_verdict_requeues_parent_with_feedback() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p").with_metadata("review", serde_json::json!({"mode": "llm"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let critic = review_children(&h, &parent).await.remove(0);
    let event = complete_child(
        &h,
        &critic,
        r#"{"verdict": "bounce", "feedback": "missing edge cases"}"#,
    )
    .await;
    handler.handle(&event).await.unwrap();

    let bounced = h.store.get(parent.id).await.unwrap();
    assert_eq!(bounced.status, TaskStatus::Pending);
    assert_eq!(bounced.bounce_count, 1);
    assert_eq!(bounced.feedback_history.len(), 1);
    assert!(bounced.feedback_history[0].feedback.contains("missing edge cases"));
}

#[tokio::test]
async fn bounce_at_ceiling_blocks_parent() {
    let h = setup().await;
    let handler = handler(&h);
    let mut task = Task::new("code", "p").with_metadata("review", serde_json::json!({"mode": "llm"}));
    task.max_bounces = 0;
    let parent = h.store.create(task, "test").await.unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let critic = review_children(&h, &parent).await.remove(0);
    let event = complete_child(&h, &critic, r#"{"verdict": "bounce", "feedback": "redo"}"#).await;
    handler.handle(&event).await.unwrap();

    assert_eq!(h.store.get(parent.id).await.unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn fix_verdict_spawns_fix_child_and_resolution_follows_strategy() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p")
                .with_metadata("review", serde_json::json!({"mode": "llm", "on_fix_done": "done"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let critic = review_children(&h, &parent).await.remove(0);
    let event = complete_child(
        &h,
        &critic,
        r#"{"verdict": "fix", "feedback": "rename the module"}"#,
    )
    .await;
    handler.handle(&event).await.unwrap();

    // The parent stays in review; a fix child carries the feedback.
    assert_eq!(h.store.get(parent.id).await.unwrap().status, TaskStatus::Review);
    let children = review_children(&h, &parent).await;
    let fix = children
        .iter()
        .find(|c| c.metadata.get("review_role").and_then(|v| v.as_str()) == Some("fix"))
        .expect("fix child should exist");
    assert_eq!(fix.task_type, "code");
    assert!(fix.prompt.contains("rename the module"));

    // Fix child completes: parent resolves per on_fix_done = done.
    let event = complete_child(&h, fix, "applied").await;
    handler.handle(&event).await.unwrap();
    assert_eq!(h.store.get(parent.id).await.unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn fix_resolution_pending_rebounces_parent() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p")
                .with_metadata("review", serde_json::json!({"mode": "llm", "on_fix_done": "pending"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let critic = review_children(&h, &parent).await.remove(0);
    let event = complete_child(&h, &critic, r#"{"verdict": "fix", "feedback": "f"}"#).await;
    handler.handle(&event).await.unwrap();

    let fix = review_children(&h, &parent)
        .await
        .into_iter()
        .find(|c| c.metadata.get("review_role").and_then(|v| v.as_str()) == Some("fix"))
        .unwrap();
    let event = complete_child(&h, &fix, "applied").await;
    handler.handle(&event).await.unwrap();

    let parent_after = h.store.get(parent.id).await.unwrap();
    assert_eq!(parent_after.status, TaskStatus::Pending);
    assert_eq!(parent_after.bounce_count, 1);
}

#[tokio::test]
async fn human_strategy_parks_approval() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p").with_metadata("review", serde_json::json!({"mode": "human"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let pending = h.approval_repo.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, parent.id);

    // Approving resolves the parent.
    handler
        .resolve_approval(pending[0].id, true, None)
        .await
        .unwrap();
    assert_eq!(h.store.get(parent.id).await.unwrap().status, TaskStatus::Done);
    assert!(h.approval_repo.list_pending().await.unwrap().is_empty());

    // Double-resolution is rejected.
    assert!(handler.resolve_approval(pending[0].id, true, None).await.is_err());
}

#[tokio::test]
async fn rejection_bounces_with_reviewer_feedback() {
    let h = setup().await;
    let handler = handler(&h);
    let parent = h
        .store
        .create(
            Task::new("code", "p").with_metadata("review", serde_json::json!({"mode": "human"})),
            "test",
        )
        .await
        .unwrap();
    handler.handle(&drive_to_review(&h, &parent).await).await.unwrap();

    let pending = h.approval_repo.list_pending().await.unwrap();
    handler
        .resolve_approval(pending[0].id, false, Some("not good enough".to_string()))
        .await
        .unwrap();

    let bounced = h.store.get(parent.id).await.unwrap();
    assert_eq!(bounced.status, TaskStatus::Pending);
    assert!(bounced.feedback_history[0].feedback.contains("not good enough"));
}

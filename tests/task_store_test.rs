mod common;

use std::time::Duration;

use chrono::Utc;
use foreman::domain::errors::DomainError;
use foreman::domain::models::{Task, TaskEventKind, TaskStatus, TransitionRequest};
use foreman::domain::ports::TaskFilter;

use common::setup;

fn lease() -> TransitionRequest {
    TransitionRequest::lease("worker-a", Utc::now() + chrono::Duration::seconds(60))
}

#[tokio::test]
async fn create_defaults_and_audit() {
    let h = setup().await;
    let task = h
        .store
        .create(Task::new("chat", "hi there"), "test")
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.bounce_count, 0);

    let entries = h.audit.for_task(task.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].from_state, "none");
    assert_eq!(entries[0].to_state, "pending");
    assert!(entries[0].before_json.is_none());
}

#[tokio::test]
async fn full_lifecycle_audit_matches_transitions() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "hi"), "test").await.unwrap();

    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();
    h.store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("hello"), "worker-a")
        .await
        .unwrap();
    let done = h
        .store
        .transition(task.id, TaskStatus::Done, TransitionRequest::default(), "human")
        .await
        .unwrap();

    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.result.as_deref(), Some("hello"));

    let entries = h.audit.for_task(task.id).await.unwrap();
    let trail: Vec<(String, String)> = entries
        .iter()
        .map(|e| (e.from_state.clone(), e.to_state.clone()))
        .collect();
    assert_eq!(
        trail,
        vec![
            ("none".to_string(), "pending".to_string()),
            ("pending".to_string(), "in_progress".to_string()),
            ("in_progress".to_string(), "review".to_string()),
            ("review".to_string(), "done".to_string()),
        ]
    );
    // One audit entry per accepted mutation.
    assert_eq!(h.audit.count_for_task(task.id).await.unwrap(), 4);
}

#[tokio::test]
async fn audit_replay_reproduces_current_state() {
    let h = setup().await;
    let task = h.store.create(Task::new("code", "build it"), "test").await.unwrap();

    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();
    h.store
        .transition(
            task.id,
            TaskStatus::Pending,
            TransitionRequest::error("first try failed"),
            "worker-a",
        )
        .await
        .unwrap();

    let current = h.store.get(task.id).await.unwrap();
    let entries = h.audit.for_task(task.id).await.unwrap();
    let replayed = entries
        .last()
        .and_then(|e| e.after_snapshot())
        .expect("last entry should deserialize");

    assert_eq!(replayed.status, current.status);
    assert_eq!(replayed.attempt_count, current.attempt_count);
    assert_eq!(replayed.lease_owner, current.lease_owner);
    assert_eq!(replayed.version, current.version);
}

#[tokio::test]
async fn lease_invariant_holds_through_lifecycle() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();
    assert!(task.lease_consistent());

    let leased = h
        .store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();
    assert_eq!(leased.lease_owner.as_deref(), Some("worker-a"));
    assert!(leased.lease_consistent());

    let reviewed = h
        .store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("out"), "worker-a")
        .await
        .unwrap();
    assert!(reviewed.lease_owner.is_none());
    assert!(reviewed.lease_consistent());
}

#[tokio::test]
async fn illegal_transitions_rejected() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();

    // PENDING → REVIEW is not a legal pair.
    let err = h
        .store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("x"), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Transition { .. }));

    // PENDING → IN_PROGRESS without a lease fails its guard.
    let err = h
        .store
        .transition(task.id, TaskStatus::InProgress, TransitionRequest::default(), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Transition { .. }));

    // Nothing was persisted.
    let current = h.store.get(task.id).await.unwrap();
    assert_eq!(current.status, TaskStatus::Pending);
    assert_eq!(h.audit.count_for_task(task.id).await.unwrap(), 1);
}

#[tokio::test]
async fn done_is_terminal_in_storage() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();
    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "d")
        .await
        .unwrap();
    h.store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("x"), "w")
        .await
        .unwrap();
    h.store
        .transition(task.id, TaskStatus::Done, TransitionRequest::default(), "h")
        .await
        .unwrap();

    for to in [TaskStatus::Pending, TaskStatus::Review, TaskStatus::Blocked] {
        let err = h
            .store
            .transition(task.id, to, TransitionRequest::feedback("f"), "h")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Transition { .. }));
    }
}

#[tokio::test]
async fn bounce_guard_enforced_at_ceiling() {
    let h = setup().await;
    let mut task = Task::new("chat", "p");
    task.max_bounces = 1;
    let task = h.store.create(task, "test").await.unwrap();

    // Drive to review, bounce once.
    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "d")
        .await
        .unwrap();
    h.store
        .transition(task.id, TaskStatus::Review, TransitionRequest::result("x"), "w")
        .await
        .unwrap();
    let bounced = h
        .store
        .transition(task.id, TaskStatus::Pending, TransitionRequest::feedback("more detail"), "reviewer")
        .await
        .unwrap();
    assert_eq!(bounced.bounce_count, 1);
    assert_eq!(bounced.feedback_history.len(), 1);

    // Second bounce exceeds max_bounces = 1.
    h.store
        .transition(bounced.id, TaskStatus::InProgress, lease(), "d")
        .await
        .unwrap();
    h.store
        .transition(bounced.id, TaskStatus::Review, TransitionRequest::result("y"), "w")
        .await
        .unwrap();
    let err = h
        .store
        .transition(bounced.id, TaskStatus::Pending, TransitionRequest::feedback("again"), "reviewer")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Transition { .. }));
}

#[tokio::test]
async fn stale_version_loses_and_store_retries() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();

    // A competing writer bumps the row between our read and write; the
    // store's re-read/retry loop should still land the transition.
    h.store
        .update(
            task.id,
            foreman::services::TaskUpdate {
                priority: Some(5),
                ..Default::default()
            },
            "other",
        )
        .await
        .unwrap();

    let leased = h
        .store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();
    assert_eq!(leased.status, TaskStatus::InProgress);
    assert_eq!(leased.priority, 5);
}

#[tokio::test]
async fn release_only_for_current_owner() {
    let h = setup().await;
    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();
    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();

    // A stranger cannot release someone else's lease.
    assert!(h.store.release(task.id, "worker-b").await.unwrap().is_none());
    let still = h.store.get(task.id).await.unwrap();
    assert_eq!(still.status, TaskStatus::InProgress);

    // The owner can.
    let released = h.store.release(task.id, "worker-a").await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.attempt_count, 1);
}

#[tokio::test]
async fn events_fire_after_commit() {
    let h = setup().await;
    let mut events = h.store.events().subscribe();

    let task = h.store.create(Task::new("chat", "p"), "test").await.unwrap();
    let created = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.event, TaskEventKind::Created);

    h.store
        .transition(task.id, TaskStatus::InProgress, lease(), "dispatcher")
        .await
        .unwrap();
    let transitioned = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transitioned.event, TaskEventKind::Transitioned);
    assert_eq!(transitioned.from_state, Some(TaskStatus::Pending));
    assert_eq!(transitioned.to_state, Some(TaskStatus::InProgress));
    // The snapshot reflects the committed row.
    assert_eq!(transitioned.task.lease_owner.as_deref(), Some("worker-a"));
}

#[tokio::test]
async fn list_filters_by_status_and_type() {
    let h = setup().await;
    h.store.create(Task::new("chat", "a"), "t").await.unwrap();
    h.store.create(Task::new("code", "b"), "t").await.unwrap();
    let blocked = h.store.create(Task::new("code", "c"), "t").await.unwrap();
    h.store
        .transition(blocked.id, TaskStatus::Blocked, TransitionRequest::default(), "t")
        .await
        .unwrap();

    let pending = h
        .store
        .list(TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    let code = h
        .store
        .list(TaskFilter {
            task_type: Some("code".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(code.len(), 2);
}

#[tokio::test]
async fn dependencies_roundtrip_through_storage() {
    let h = setup().await;
    let dep = h.store.create(Task::new("code", "dep"), "t").await.unwrap();
    let task = h
        .store
        .create(Task::new("code", "main").with_dependency(dep.id), "t")
        .await
        .unwrap();

    let loaded = h.store.get(task.id).await.unwrap();
    assert_eq!(loaded.depends_on, vec![dep.id]);
}

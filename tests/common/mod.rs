//! Shared test fixtures: in-memory database and wired services.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use foreman::adapters::sqlite::{
    SqliteApprovalRepository, SqliteAuditLog, SqliteDagRunRepository,
    SqliteScheduleStateRepository, SqliteTaskRepository, SqliteTemplateRepository, Store,
};
use foreman::domain::models::TaskStatus;
use foreman::domain::ports::AuditLog;
use foreman::services::{EventBus, PriorityQueue, TaskStore};
use sqlx::SqlitePool;
use uuid::Uuid;

pub struct TestHarness {
    pub pool: SqlitePool,
    pub store: Arc<TaskStore>,
    pub queue: PriorityQueue,
    pub audit: Arc<dyn AuditLog>,
    pub task_repo: Arc<SqliteTaskRepository>,
    pub template_repo: Arc<SqliteTemplateRepository>,
    pub schedule_repo: Arc<SqliteScheduleStateRepository>,
    pub approval_repo: Arc<SqliteApprovalRepository>,
    pub dag_repo: Arc<SqliteDagRunRepository>,
}

pub async fn setup() -> TestHarness {
    let db = Store::open_in_memory()
        .await
        .expect("failed to create test database");
    let pool = db.pool().clone();

    let task_repo = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let store = Arc::new(TaskStore::new(task_repo.clone(), EventBus::default()));
    let queue = PriorityQueue::new(task_repo.clone());

    TestHarness {
        store,
        queue,
        audit: Arc::new(SqliteAuditLog::new(pool.clone())),
        task_repo,
        template_repo: Arc::new(SqliteTemplateRepository::new(pool.clone())),
        schedule_repo: Arc::new(SqliteScheduleStateRepository::new(pool.clone())),
        approval_repo: Arc::new(SqliteApprovalRepository::new(pool.clone())),
        dag_repo: Arc::new(SqliteDagRunRepository::new(pool.clone())),
        pool,
    }
}

/// Poll until the task reaches `expected`, panicking after `timeout`.
pub async fn wait_for_status(
    store: &Arc<TaskStore>,
    id: Uuid,
    expected: TaskStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = store.get(id).await.expect("task should exist");
        if task.status == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {:?}, expected {:?} (last_error: {:?})",
            task.status,
            expected,
            task.last_error
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

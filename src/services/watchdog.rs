//! Watchdog: recovers tasks whose leases have expired.
//!
//! The only component that revokes leases. It never terminates the
//! orphaned adapter process; clearing `lease_owner` is enough to make the
//! adapter's eventual completion transition fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::errors::DomainResult;
use crate::domain::models::transition::TransitionRequest;
use crate::domain::models::{Task, TaskStatus};
use crate::services::task_store::TaskStore;

/// What to do with an expired lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Return the task to the queue, consuming an attempt. Falls through
    /// to blocking when the attempt ceiling is hit.
    Requeue,
    /// Park the task for operator attention.
    Block,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Slack added to the lease deadline before a lease counts as expired
    pub grace: Duration,
    pub policy: ExpiryPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            policy: ExpiryPolicy::Requeue,
        }
    }
}

pub struct Watchdog {
    store: Arc<TaskStore>,
    config: WatchdogConfig,
    running: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(store: Arc<TaskStore>, config: WatchdogConfig) -> Self {
        Self {
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("watchdog started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.sweep().await {
                tracing::error!("watchdog sweep failed: {e}");
            }
            tokio::time::sleep(self.config.interval).await;
        }
        tracing::info!("watchdog stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One sweep over expired leases. Per-task transition failures are
    /// logged and do not stop the sweep.
    pub async fn sweep(&self) -> DomainResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.grace).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let expired = self.store.repository().expired_leases(cutoff).await?;
        let mut recovered = 0;

        for task in expired {
            match self.recover(&task).await {
                Ok(to) => {
                    recovered += 1;
                    tracing::warn!(
                        task_id = %task.id,
                        previous_owner = task.lease_owner.as_deref().unwrap_or("?"),
                        to = to.as_str(),
                        "expired lease recovered"
                    );
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, "lease recovery skipped: {e}");
                }
            }
        }
        Ok(recovered)
    }

    async fn recover(&self, task: &Task) -> DomainResult<TaskStatus> {
        let previous_owner = task.lease_owner.as_deref().unwrap_or("unknown");
        let expired_at = task
            .lease_expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let request = TransitionRequest::error(format!(
            "lease expired (previous_owner: {previous_owner}, expires_at: {expired_at})"
        ));

        // Requeue falls through to Block once attempts are exhausted.
        let to = match self.config.policy {
            ExpiryPolicy::Requeue if task.attempt_count < task.max_attempts => TaskStatus::Pending,
            _ => TaskStatus::Blocked,
        };

        self.store.transition(task.id, to, request, "watchdog").await?;
        Ok(to)
    }
}

//! Dispatcher: leases pending tasks and drives adapter executions.
//!
//! The only component that acquires leases. Per tick it fills each WIP
//! bucket from the priority queue, selects the first adapter that can
//! handle the task, takes the lease through a guarded transition (losers
//! of the race just move on), and spawns the execution without blocking
//! the loop. A heartbeat task refreshes the lease while the adapter runs
//! and aborts itself the moment the row no longer names this owner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult, FailureClass};
use crate::domain::models::gate::{GateDef, RetrySpec};
use crate::domain::models::transition::TransitionRequest;
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::{ExecutionAdapter, RetryContext};
use crate::services::gates::{GateMode, GateRunner};
use crate::services::queue::PriorityQueue;
use crate::services::retry::{self, Produced};
use crate::services::task_store::TaskStore;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-task-type WIP ceilings; types not listed share the default bucket
    pub wip_limits: HashMap<String, usize>,
    /// Ceiling for the default bucket
    pub default_wip: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wip_limits: HashMap::new(),
            default_wip: 2,
            lease_ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            tick_interval: Duration::from_millis(500),
        }
    }
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    queue: PriorityQueue,
    adapters: Vec<Arc<dyn ExecutionAdapter>>,
    gates: Arc<GateRunner>,
    config: DispatcherConfig,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        queue: PriorityQueue,
        adapters: Vec<Arc<dyn ExecutionAdapter>>,
        gates: Arc<GateRunner>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            adapters,
            gates,
            config,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run until [`stop`](Self::stop). Ticks never propagate errors; a
    /// failed tick is logged and the loop continues.
    pub async fn run(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("dispatcher started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                tracing::error!("dispatcher tick failed: {e}");
            }
            tokio::time::sleep(self.config.tick_interval).await;
        }
        tracing::info!("dispatcher stopped");
    }

    /// Refuse new leases and wait for in-flight executions to finish their
    /// transitions (bounded).
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// One dispatch pass: fill every bucket up to its WIP ceiling.
    pub async fn tick(self: &Arc<Self>) -> DomainResult<usize> {
        let mut counts = self.store.repository().count_in_progress_by_type().await?;
        let mut dispatched = 0;

        let mut typed: Vec<(&String, usize)> = self.config.wip_limits.iter().map(|(t, n)| (t, *n)).collect();
        typed.sort();

        for (task_type, limit) in typed {
            while (counts.get(task_type).copied().unwrap_or(0) as usize) < limit {
                match self.queue.next(Some(task_type.as_str())).await? {
                    Some(task) => {
                        if self.try_dispatch(task).await {
                            *counts.entry(task_type.clone()).or_insert(0) += 1;
                            dispatched += 1;
                        } else {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        // Default bucket: everything without an explicit ceiling, counted
        // together.
        let excluded: Vec<String> = self.config.wip_limits.keys().cloned().collect();
        let mut default_count: usize = counts
            .iter()
            .filter(|(t, _)| !excluded.contains(t))
            .map(|(_, n)| *n as usize)
            .sum();
        while default_count < self.config.default_wip {
            match self.queue.next_excluding_types(&excluded).await? {
                Some(task) => {
                    if self.try_dispatch(task).await {
                        default_count += 1;
                        dispatched += 1;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }

        Ok(dispatched)
    }

    /// Lease one task and spawn its execution. Returns false when no
    /// adapter matches or the lease race was lost.
    async fn try_dispatch(self: &Arc<Self>, task: Task) -> bool {
        let Some(adapter) = self.adapters.iter().find(|a| a.can_handle(&task)).cloned() else {
            tracing::warn!(task_id = %task.id, task_type = %task.task_type, "no adapter can handle task");
            return false;
        };

        let owner = adapter.name().to_string();
        let lease = TransitionRequest::lease(
            owner.clone(),
            Utc::now() + chrono::Duration::from_std(self.config.lease_ttl).unwrap_or_else(|_| chrono::Duration::seconds(120)),
        );

        let leased = match self
            .store
            .transition(task.id, TaskStatus::InProgress, lease, "dispatcher")
            .await
        {
            Ok(leased) => leased,
            Err(DomainError::Transition { .. } | DomainError::Concurrency(_)) => {
                // Another worker won the row; not an error.
                return false;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "lease acquisition failed: {e}");
                return false;
            }
        };

        let this = Arc::clone(self);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            this.execute_leased(leased, adapter, owner).await;
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    async fn execute_leased(&self, task: Task, adapter: Arc<dyn ExecutionAdapter>, owner: String) {
        let heartbeat = self.spawn_heartbeat(task.id, owner.clone());

        let outcome = self.run_attempts(&task, adapter.as_ref()).await;
        heartbeat.abort();

        match outcome {
            Ok((result, evidence_ref)) => {
                let request = TransitionRequest {
                    result: Some(result),
                    evidence_ref,
                    ..Default::default()
                };
                match self
                    .store
                    .transition(task.id, TaskStatus::Review, request, &owner)
                    .await
                {
                    Ok(_) => {}
                    Err(DomainError::Transition { .. }) => {
                        // Lease was revoked while we ran; the watchdog owns
                        // the row now.
                        tracing::warn!(task_id = %task.id, owner = %owner, "completion discarded, lease expired");
                    }
                    Err(e) => tracing::error!(task_id = %task.id, "review transition failed: {e}"),
                }
            }
            Err(error_message) => self.fail_execution(&task, &owner, &error_message).await,
        }
    }

    /// Execute the adapter under the task's gate/retry policy. Returns the
    /// accepted output, or a terminal error message for this lease.
    async fn run_attempts(
        &self,
        task: &Task,
        adapter: &dyn ExecutionAdapter,
    ) -> Result<(String, Option<String>), String> {
        let retry_spec = task_retry_spec(task);
        let gate_defs = task_gates(task);

        let evidence = Arc::new(std::sync::Mutex::new(None::<String>));
        let evidence_producer = evidence.clone();

        let produced = retry::run(
            &retry_spec,
            |ctx: RetryContext| {
                let evidence = evidence_producer.clone();
                async move {
                    let result = adapter.execute(task, Some(&ctx)).await?;
                    if !result.succeeded() {
                        let class = FailureClass::classify(result.exit_code, &result.output);
                        return Err(DomainError::Adapter {
                            class,
                            message: format!("exit code {}: {}", result.exit_code, snippet(&result.output)),
                        });
                    }
                    *evidence.lock().expect("evidence lock") =
                        result.diff.clone().or_else(|| result.files_changed.first().cloned());
                    let data = result
                        .structured
                        .clone()
                        .unwrap_or_else(|| Value::String(result.output.clone()));
                    Ok(Produced {
                        data,
                        raw: result.output,
                    })
                }
            },
            |data, raw, _ctx| {
                let gates = Arc::clone(&self.gates);
                let gate_defs = gate_defs.clone();
                async move { gates.run(&gate_defs, &data, &raw, GateMode::ShortCircuit).await }
            },
            None,
        )
        .await;

        match produced {
            Ok(outcome) => {
                let evidence_ref = evidence.lock().expect("evidence lock").clone();
                Ok((outcome.raw, evidence_ref))
            }
            Err(DomainError::GateExhausted(history)) => {
                let last_failures: Vec<String> = history
                    .last()
                    .map(|r| {
                        r.gates
                            .iter()
                            .filter(|g| !g.passed)
                            .map(|g| format!("{}: {}", g.gate_name, g.reason.as_deref().unwrap_or("failed")))
                            .collect()
                    })
                    .unwrap_or_default();
                Err(format!(
                    "gates failed after {} attempts ({})",
                    history.len(),
                    last_failures.join("; ")
                ))
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Map a failed execution to IN_PROGRESS→PENDING (retries left) or
    /// IN_PROGRESS→BLOCKED (exhausted). A revoked lease is swallowed.
    async fn fail_execution(&self, task: &Task, owner: &str, error_message: &str) {
        if let Err(e) = self.store.check_lease(task.id, owner).await {
            tracing::warn!(task_id = %task.id, owner = %owner, "failure discarded: {e}");
            return;
        }

        let current = match self.store.get(task.id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(task_id = %task.id, "failure handling lost the row: {e}");
                return;
            }
        };

        let to = if current.has_attempts_left() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        match self
            .store
            .transition(task.id, to, TransitionRequest::error(error_message), owner)
            .await
        {
            Ok(_) => {
                tracing::info!(task_id = %task.id, to = to.as_str(), "execution failed: {error_message}");
            }
            Err(DomainError::Transition { .. }) => {
                tracing::warn!(task_id = %task.id, owner = %owner, "failure transition discarded, lease expired");
            }
            Err(e) => tracing::error!(task_id = %task.id, "failure transition errored: {e}"),
        }
    }

    fn spawn_heartbeat(&self, task_id: uuid::Uuid, owner: String) -> tokio::task::JoinHandle<()> {
        let repo = Arc::clone(self.store.repository());
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.lease_ttl;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120));
                match repo.refresh_lease(task_id, &owner, expires_at).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Watchdog recovery raced us; the lease is gone.
                        tracing::warn!(task_id = %task_id, owner = %owner, "heartbeat lost lease, stopping");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(task_id = %task_id, "heartbeat failed: {e}");
                        break;
                    }
                }
            }
        })
    }
}

/// Retry policy from task metadata key `retry`, defaulting to one attempt.
fn task_retry_spec(task: &Task) -> RetrySpec {
    task.metadata
        .get("retry")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Gate list from task metadata key `gates`.
fn task_gates(task: &Task) -> Vec<GateDef> {
    task.metadata
        .get("gates")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn snippet(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= 240 {
        trimmed.to_string()
    } else {
        format!("{}...", &trimmed[..240])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_spec_from_metadata() {
        let task = Task::new("code", "p").with_metadata(
            "retry",
            serde_json::json!({"max": 3, "feedback": true, "delay_ms": 5, "backoff": "linear"}),
        );
        let spec = task_retry_spec(&task);
        assert_eq!(spec.max, 3);
        assert!(spec.feedback);

        let spec = task_retry_spec(&Task::new("code", "p"));
        assert_eq!(spec.max, 1);
    }

    #[test]
    fn gates_from_metadata() {
        let task = Task::new("code", "p").with_metadata(
            "gates",
            serde_json::json!([{"kind": "word_count", "min": 5}]),
        );
        assert_eq!(task_gates(&task).len(), 1);
        assert!(task_gates(&Task::new("code", "p")).is_empty());
    }
}

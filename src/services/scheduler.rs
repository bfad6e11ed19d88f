//! Scheduler: fires template instantiations on fixed intervals.
//!
//! Firing state (`last_run_at`, `next_run_at`) is persisted per template,
//! so restarts pick up where the previous process left off: an overdue
//! `next_run_at` fires immediately.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ScheduleState;
use crate::domain::ports::{ScheduleStateRepository, TemplateRepository};
use crate::services::task_store::TaskStore;

/// One configured schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub template_name: String,
    /// Duration string: `Nm`, `Nh`, or `Nd`
    pub every: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Parse `Nm`/`Nh`/`Nd` duration strings; anything else fails.
pub fn parse_every(s: &str) -> DomainResult<ChronoDuration> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(DomainError::Validation(format!("bad duration: {s:?}")));
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    let n: i64 = digits
        .parse()
        .map_err(|_| DomainError::Validation(format!("bad duration: {s:?}")))?;
    if n <= 0 {
        return Err(DomainError::Validation(format!("duration must be positive: {s:?}")));
    }
    match unit {
        "m" => Ok(ChronoDuration::minutes(n)),
        "h" => Ok(ChronoDuration::hours(n)),
        "d" => Ok(ChronoDuration::days(n)),
        _ => Err(DomainError::Validation(format!("bad duration unit: {s:?}"))),
    }
}

pub struct Scheduler {
    templates: Arc<dyn TemplateRepository>,
    state: Arc<dyn ScheduleStateRepository>,
    store: Arc<TaskStore>,
    schedules: Vec<ScheduleConfig>,
    shutdown: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        templates: Arc<dyn TemplateRepository>,
        state: Arc<dyn ScheduleStateRepository>,
        store: Arc<TaskStore>,
        schedules: Vec<ScheduleConfig>,
    ) -> Self {
        Self {
            templates,
            state,
            store,
            schedules,
            shutdown: Arc::new(Notify::new()),
            handles: Vec::new(),
        }
    }

    /// Spawn one timer loop per enabled schedule. Schedules with unparsable
    /// intervals are logged and skipped.
    pub fn start(&mut self) {
        for schedule in self.schedules.clone() {
            if !schedule.enabled {
                continue;
            }
            let every = match parse_every(&schedule.every) {
                Ok(every) => every,
                Err(e) => {
                    tracing::error!(template = %schedule.template_name, "schedule skipped: {e}");
                    continue;
                }
            };

            let templates = Arc::clone(&self.templates);
            let state = Arc::clone(&self.state);
            let store = Arc::clone(&self.store);
            let shutdown = Arc::clone(&self.shutdown);
            let name = schedule.template_name.clone();

            self.handles.push(tokio::spawn(async move {
                schedule_loop(name, every, templates, state, store, shutdown).await;
            }));
        }
        tracing::info!(count = self.handles.len(), "scheduler started");
    }

    /// Cancel all outstanding timers.
    pub fn stop(&mut self) {
        self.shutdown.notify_waiters();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        tracing::info!("scheduler stopped");
    }
}

async fn schedule_loop(
    name: String,
    every: ChronoDuration,
    templates: Arc<dyn TemplateRepository>,
    state_repo: Arc<dyn ScheduleStateRepository>,
    store: Arc<TaskStore>,
    shutdown: Arc<Notify>,
) {
    loop {
        let state = match state_repo.get(&name).await {
            Ok(state) => state.unwrap_or(ScheduleState {
                template_name: name.clone(),
                last_run_at: None,
                next_run_at: None,
            }),
            Err(e) => {
                tracing::error!(template = %name, "schedule state read failed: {e}");
                if wait_or_shutdown(&shutdown, std::time::Duration::from_secs(30)).await {
                    return;
                }
                continue;
            }
        };

        let now = Utc::now();
        let due = state.next_run_at.map_or(true, |next| next <= now);

        if due {
            fire(&name, &templates, &store).await;
            let fired_at = Utc::now();
            let new_state = ScheduleState {
                template_name: name.clone(),
                last_run_at: Some(fired_at),
                next_run_at: Some(fired_at + every),
            };
            if let Err(e) = state_repo.put(&new_state).await {
                tracing::error!(template = %name, "schedule state write failed: {e}");
            }
            continue;
        }

        let next = state.next_run_at.unwrap_or(now);
        let wait = sleep_until(next);
        if wait_or_shutdown(&shutdown, wait).await {
            return;
        }
    }
}

fn sleep_until(next: DateTime<Utc>) -> std::time::Duration {
    (next - Utc::now()).to_std().unwrap_or(std::time::Duration::from_millis(10))
}

/// Returns true on shutdown.
async fn wait_or_shutdown(shutdown: &Notify, duration: std::time::Duration) -> bool {
    tokio::select! {
        () = shutdown.notified() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

/// Instantiate the template into pending tasks. Missing templates and
/// validation failures are logged; the schedule keeps running.
async fn fire(name: &str, templates: &Arc<dyn TemplateRepository>, store: &Arc<TaskStore>) {
    let template = match templates.get(name).await {
        Ok(Some(template)) => template,
        Ok(None) => {
            tracing::error!(template = %name, "schedule fired but template is missing");
            return;
        }
        Err(e) => {
            tracing::error!(template = %name, "template load failed: {e}");
            return;
        }
    };

    if let Err(e) = template.validate() {
        tracing::error!(template = %name, "template validation failed: {e}");
        return;
    }

    let tasks = template.instantiate();
    let count = tasks.len();
    for task in tasks {
        if let Err(e) = store.create(task, "scheduler").await {
            tracing::error!(template = %name, "scheduled task creation failed: {e}");
        }
    }
    tracing::info!(template = %name, count, "schedule fired");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_every_accepts_m_h_d() {
        assert_eq!(parse_every("5m").unwrap(), ChronoDuration::minutes(5));
        assert_eq!(parse_every("2h").unwrap(), ChronoDuration::hours(2));
        assert_eq!(parse_every("1d").unwrap(), ChronoDuration::days(1));
    }

    #[test]
    fn parse_every_rejects_other_units() {
        assert!(parse_every("5s").is_err());
        assert!(parse_every("5w").is_err());
        assert!(parse_every("m").is_err());
        assert!(parse_every("-5m").is_err());
        assert!(parse_every("0h").is_err());
        assert!(parse_every("").is_err());
    }
}

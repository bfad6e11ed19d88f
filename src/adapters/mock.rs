//! Scriptable mock adapter for tests and dry runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Task;
use crate::domain::ports::{AdapterResult, ExecutionAdapter, RetryContext};

/// One scripted response; consumed in order, last one repeats.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub output: String,
    pub exit_code: i32,
}

impl MockResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
        }
    }

    pub fn failed(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }
}

/// Adapter that replays scripted responses and records invocations.
pub struct MockAdapter {
    name: String,
    task_types: Vec<String>,
    responses: Mutex<Vec<MockResponse>>,
    call_count: AtomicUsize,
    aborted: Mutex<Vec<Uuid>>,
    feedback_seen: Mutex<Vec<Option<String>>>,
    /// Per-call artificial latency, for lease-expiry tests
    pub delay_ms: u64,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>, task_types: Vec<String>, responses: Vec<MockResponse>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            task_types,
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            aborted: Mutex::new(Vec::new()),
            feedback_seen: Mutex::new(Vec::new()),
            delay_ms: 0,
        })
    }

    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub async fn aborted_tasks(&self) -> Vec<Uuid> {
        self.aborted.lock().await.clone()
    }

    /// Feedback received per invocation, in call order.
    pub async fn feedback_seen(&self) -> Vec<Option<String>> {
        self.feedback_seen.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn task_types(&self) -> &[String] {
        &self.task_types
    }

    async fn execute(&self, _task: &Task, retry: Option<&RetryContext>) -> DomainResult<AdapterResult> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.feedback_seen
            .lock()
            .await
            .push(retry.and_then(|r| r.feedback.clone()));
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        let responses = self.responses.lock().await;
        let response = responses
            .get(call)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or_else(|| MockResponse::ok(""));

        let structured = serde_json::from_str(&response.output).ok();
        Ok(AdapterResult {
            output: response.output,
            structured,
            files_changed: Vec::new(),
            diff: None,
            exit_code: response.exit_code,
            duration_ms: self.delay_ms,
            cost: None,
        })
    }

    async fn abort(&self, task_id: Uuid) {
        self.aborted.lock().await.push(task_id);
    }
}

//! Webhook emitter: forwards review/blocked/done events to subscribers.
//!
//! Delivery is fire-and-forget on a bounded worker set. One subscriber
//! failing or hanging never blocks another, and a full delivery queue
//! drops (with a log line) rather than backpressuring the event bus.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::{TaskEventKind, TaskStatus, WebhookEvent, WebhookEventKind};
use crate::domain::ports::TaskRepository;
use crate::services::event_bus::EventBus;

/// A configured webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscriber {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub subscribers: Vec<WebhookSubscriber>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            workers: 2,
            queue_capacity: 64,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WebhookEmitter {
    config: WebhookConfig,
    repo: Arc<dyn TaskRepository>,
    handles: Vec<JoinHandle<()>>,
}

impl WebhookEmitter {
    pub fn new(config: WebhookConfig, repo: Arc<dyn TaskRepository>) -> Self {
        Self {
            config,
            repo,
            handles: Vec::new(),
        }
    }

    /// Subscribe to the bus and start the delivery workers.
    pub fn start(&mut self, events: &EventBus) {
        if self.config.subscribers.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::channel::<(WebhookSubscriber, WebhookEvent)>(self.config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..self.config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let timeout = self.config.request_timeout;
            self.handles.push(tokio::spawn(async move {
                let client = reqwest::Client::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((subscriber, event)) = next else { break };
                    deliver(&client, &subscriber, &event, timeout).await;
                }
                tracing::debug!(worker, "webhook worker exited");
            }));
        }

        let mut bus = events.subscribe();
        let subscribers = self.config.subscribers.clone();
        let repo = Arc::clone(&self.repo);
        self.handles.push(tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(event) => {
                        for payload in to_webhook_events(&event, repo.as_ref()).await {
                            for subscriber in &subscribers {
                                if let Err(e) = tx.try_send((subscriber.clone(), payload.clone())) {
                                    tracing::warn!(
                                        subscriber = %subscriber.name,
                                        "webhook queue full, dropping event: {e}"
                                    );
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "webhook emitter lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Map a store event to outward webhook payloads. A DONE task that
/// finishes its pipeline additionally emits `pipeline_complete`.
async fn to_webhook_events(
    event: &crate::domain::models::TaskEvent,
    repo: &dyn TaskRepository,
) -> Vec<WebhookEvent> {
    if event.event != TaskEventKind::Transitioned {
        return Vec::new();
    }
    let task = &event.task;
    let mut payloads = Vec::new();

    match event.to_state {
        Some(TaskStatus::Review) => {
            payloads.push(WebhookEvent::from_task(WebhookEventKind::Review, task));
        }
        Some(TaskStatus::Blocked) => {
            payloads.push(WebhookEvent::from_task(WebhookEventKind::Blocked, task));
        }
        Some(TaskStatus::Done) => {
            let mut done = WebhookEvent::from_task(WebhookEventKind::Done, task);
            if let Some(pipeline_id) = &task.pipeline_id {
                match repo.list_by_pipeline(pipeline_id).await {
                    Ok(siblings) => {
                        let total = siblings.len();
                        let finished = siblings
                            .iter()
                            .filter(|t| t.status == TaskStatus::Done)
                            .count();
                        done.pipeline_progress = Some(format!("{finished}/{total}"));
                        if finished == total {
                            let mut complete =
                                WebhookEvent::from_task(WebhookEventKind::PipelineComplete, task);
                            complete.pipeline_progress = Some(format!("{finished}/{total}"));
                            payloads.push(done);
                            payloads.push(complete);
                            return payloads;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(pipeline_id = %pipeline_id, "pipeline progress lookup failed: {e}");
                    }
                }
            }
            payloads.push(done);
        }
        _ => {}
    }
    payloads
}

async fn deliver(
    client: &reqwest::Client,
    subscriber: &WebhookSubscriber,
    event: &WebhookEvent,
    timeout: Duration,
) {
    let result = client
        .post(&subscriber.url)
        .timeout(timeout)
        .json(event)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(subscriber = %subscriber.name, event = ?event.event, "webhook delivered");
        }
        Ok(response) => {
            tracing::warn!(
                subscriber = %subscriber.name,
                status = %response.status(),
                "webhook delivery rejected"
            );
        }
        Err(e) => {
            tracing::warn!(subscriber = %subscriber.name, "webhook delivery failed: {e}");
        }
    }
}

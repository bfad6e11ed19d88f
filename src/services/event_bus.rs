//! In-process event bus for post-commit task events.
//!
//! The task store publishes after its transaction commits, so subscribers
//! never observe uncommitted state. Delivery is a tokio broadcast channel;
//! a slow subscriber lags and drops, it never blocks the store.

use tokio::sync::broadcast;

use crate::domain::models::TaskEvent;

/// Default channel capacity before lagging subscribers drop events.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; silently a no-op with zero subscribers.
    pub fn publish(&self, event: TaskEvent) {
        let receivers = self.sender.receiver_count();
        if let Err(e) = self.sender.send(event) {
            if receivers > 0 {
                tracing::warn!("event bus send failed with {receivers} receivers: {e}");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Task, TaskEventKind};

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(TaskEvent::created(Task::new("chat", "hi"), "test"));

        assert_eq!(rx1.recv().await.unwrap().event, TaskEventKind::Created);
        assert_eq!(rx2.recv().await.unwrap().event, TaskEventKind::Created);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(TaskEvent::created(Task::new("chat", "hi"), "test"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}

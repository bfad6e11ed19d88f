//! Application services: the coordination kernel.

pub mod dag_engine;
pub mod dispatcher;
pub mod event_bus;
pub mod expression;
pub mod gates;
pub mod queue;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod task_store;
pub mod watchdog;
pub mod webhook;

pub use dag_engine::{BlockAgent, DagEngine};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use event_bus::EventBus;
pub use gates::{CheckOutcome, GateMode, GateRunner, StructuralValidator};
pub use queue::{PriorityQueue, ReorderAnchor};
pub use retry::{compile_feedback, Produced, RetryOutcome};
pub use review::{ReviewHandler, ReviewMode, ReviewStrategy};
pub use scheduler::{parse_every, ScheduleConfig, Scheduler};
pub use task_store::{TaskStore, TaskUpdate};
pub use watchdog::{ExpiryPolicy, Watchdog, WatchdogConfig};
pub use webhook::{WebhookConfig, WebhookEmitter, WebhookSubscriber};

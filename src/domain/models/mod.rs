//! Domain models for the Foreman orchestrator.

pub mod audit;
pub mod dag;
pub mod event;
pub mod gate;
pub mod task;
pub mod template;
pub mod transition;

pub use audit::AuditEntry;
pub use dag::{
    BlockDef, BlockExecution, BlockInstance, BlockRetry, BlockRetryState, BlockStatus,
    DagDefinition, DagRun, EdgeDef, InputPort, OutputPort, RunStatus,
};
pub use event::{TaskEvent, TaskEventKind, WebhookEvent, WebhookEventKind};
pub use gate::{AttemptRecord, Backoff, GateDef, GateOutcome, RetrySpec, SchemaDef, SchemaType};
pub use task::{BackendConfig, FeedbackEntry, Task, TaskStatus};
pub use template::{Approval, ApprovalStatus, ScheduleState, TaskTemplate, TemplateTask};
pub use transition::{apply_transition, can_transition, validate_transition, TaskPatch, TransitionRequest};

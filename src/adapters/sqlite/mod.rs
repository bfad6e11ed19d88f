//! SQLite adapters for the Foreman orchestrator's durable store.
//!
//! [`store::Store`] owns opening, pragmas, and schema migration; `row`
//! decodes the TEXT columns; the repository modules implement the domain
//! ports over the shared pool.

pub mod audit_log;
pub mod dag_run_repository;
pub mod row;
pub mod store;
pub mod task_repository;
pub mod template_repository;

pub use audit_log::SqliteAuditLog;
pub use dag_run_repository::SqliteDagRunRepository;
pub use store::{Store, StoreError, StoreOptions};
pub use task_repository::SqliteTaskRepository;
pub use template_repository::{
    SqliteApprovalRepository, SqliteScheduleStateRepository, SqliteTemplateRepository,
};

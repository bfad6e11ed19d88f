//! Pipeline run repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{DagDefinition, DagRun};

/// Persistence for pipeline definitions and runs.
///
/// Definitions and runs are stored as JSON blobs; the engine owns all run
/// mutations and writes the whole run back after each step.
#[async_trait]
pub trait DagRunRepository: Send + Sync {
    async fn save_definition(&self, definition: &DagDefinition) -> DomainResult<()>;

    async fn get_definition(&self, name: &str) -> DomainResult<Option<DagDefinition>>;

    async fn create_run(&self, run: &DagRun) -> DomainResult<()>;

    async fn get_run(&self, id: &str) -> DomainResult<Option<DagRun>>;

    async fn update_run(&self, run: &DagRun) -> DomainResult<()>;

    async fn list_runs(&self, dag_name: Option<&str>) -> DomainResult<Vec<DagRun>>;
}

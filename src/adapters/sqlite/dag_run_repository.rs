//! SQLite persistence for pipeline definitions and runs.
//!
//! Definitions and runs are JSON blobs; the status column is denormalized
//! for listing without deserializing every run.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{DagDefinition, DagRun};
use crate::domain::ports::DagRunRepository;

#[derive(Clone)]
pub struct SqliteDagRunRepository {
    pool: SqlitePool,
}

impl SqliteDagRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DagRunRepository for SqliteDagRunRepository {
    async fn save_definition(&self, definition: &DagDefinition) -> DomainResult<()> {
        let dag_json = serde_json::to_string(definition)?;
        sqlx::query(
            r"INSERT INTO dag_definitions (name, dag_json, updated_at) VALUES (?, ?, ?)
              ON CONFLICT(name) DO UPDATE SET dag_json = excluded.dag_json,
                                              updated_at = excluded.updated_at",
        )
        .bind(&definition.name)
        .bind(&dag_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_definition(&self, name: &str) -> DomainResult<Option<DagDefinition>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT dag_json FROM dag_definitions WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(json,)| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DomainError::Serialization(e.to_string()))
    }

    async fn create_run(&self, run: &DagRun) -> DomainResult<()> {
        let run_json = serde_json::to_string(run)?;
        sqlx::query(
            r"INSERT INTO dag_runs (id, dag_name, status, run_json, created_at, updated_at)
              VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.dag_name)
        .bind(run.status.as_str())
        .bind(&run_json)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> DomainResult<Option<DagRun>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT run_json FROM dag_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(json,)| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DomainError::Serialization(e.to_string()))
    }

    async fn update_run(&self, run: &DagRun) -> DomainResult<()> {
        let run_json = serde_json::to_string(run)?;
        let result = sqlx::query(
            "UPDATE dag_runs SET status = ?, run_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(&run_json)
        .bind(Utc::now().to_rfc3339())
        .bind(&run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::RunNotFound(run.id.clone()));
        }
        Ok(())
    }

    async fn list_runs(&self, dag_name: Option<&str>) -> DomainResult<Vec<DagRun>> {
        let rows: Vec<(String,)> = if let Some(dag_name) = dag_name {
            sqlx::query_as(
                "SELECT run_json FROM dag_runs WHERE dag_name = ? ORDER BY created_at DESC",
            )
            .bind(dag_name)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as("SELECT run_json FROM dag_runs ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter()
            .map(|(json,)| {
                serde_json::from_str(&json).map_err(|e| DomainError::Serialization(e.to_string()))
            })
            .collect()
    }
}

//! Execution adapter port.
//!
//! Adapters run tasks: a shell command, a subprocess CLI tool, an HTTP LLM
//! call. The dispatcher only sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::gate::GateOutcome;
use crate::domain::models::Task;

/// Token/dollar accounting reported by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usd: Option<f64>,
}

/// What an adapter produced for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
}

impl AdapterResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Retry context handed to an adapter on attempts after the first.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Compiled feedback from the previous attempt's gate failures
    pub feedback: Option<String>,
    /// The previous attempt's failing gates
    pub failures: Vec<GateOutcome>,
}

/// A pluggable task executor.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Stable adapter name; matched against `task.backend`.
    fn name(&self) -> &str;

    /// Task types this adapter accepts when no backend is pinned.
    fn task_types(&self) -> &[String];

    /// Match precedence: exact backend name, then `name/` prefix, then
    /// task type membership.
    fn can_handle(&self, task: &Task) -> bool {
        if let Some(backend) = &task.backend {
            return backend == self.name() || backend.starts_with(&format!("{}/", self.name()));
        }
        self.task_types().iter().any(|t| *t == task.task_type)
    }

    /// Execute the task once. Failure is reported through `exit_code`,
    /// or by an error for infrastructure-level faults.
    async fn execute(&self, task: &Task, retry: Option<&RetryContext>) -> DomainResult<AdapterResult>;

    /// Best-effort cancellation of a running execution.
    async fn abort(&self, task_id: Uuid);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdapter {
        types: Vec<String>,
    }

    #[async_trait]
    impl ExecutionAdapter for FakeAdapter {
        fn name(&self) -> &str {
            "claude"
        }

        fn task_types(&self) -> &[String] {
            &self.types
        }

        async fn execute(&self, _task: &Task, _retry: Option<&RetryContext>) -> DomainResult<AdapterResult> {
            Ok(AdapterResult::default())
        }

        async fn abort(&self, _task_id: Uuid) {}
    }

    #[test]
    fn match_precedence() {
        let adapter = FakeAdapter {
            types: vec!["code".to_string()],
        };

        let mut task = Task::new("code", "p");
        assert!(adapter.can_handle(&task));

        task.task_type = "chat".to_string();
        assert!(!adapter.can_handle(&task));

        task.backend = Some("claude".to_string());
        assert!(adapter.can_handle(&task));

        task.backend = Some("claude/opus".to_string());
        assert!(adapter.can_handle(&task));

        // A pinned backend overrides type membership entirely.
        task.backend = Some("codex".to_string());
        task.task_type = "code".to_string();
        assert!(!adapter.can_handle(&task));
    }
}

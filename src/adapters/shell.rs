//! Shell command execution adapter.
//!
//! Runs `backend_config.command` through `sh -c` with the task prompt on
//! stdin-adjacent env vars. Reference implementation of the adapter port;
//! real deployments add subprocess CLI tools and HTTP LLM adapters.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, FailureClass};
use crate::domain::models::Task;
use crate::domain::ports::{AdapterResult, ExecutionAdapter, RetryContext};

const DEFAULT_TIMEOUT_MS: u64 = 10 * 60 * 1000;

pub struct ShellAdapter {
    name: String,
    task_types: Vec<String>,
}

impl ShellAdapter {
    pub fn new(task_types: Vec<String>) -> Self {
        Self {
            name: "shell".to_string(),
            task_types,
        }
    }
}

#[async_trait]
impl ExecutionAdapter for ShellAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn task_types(&self) -> &[String] {
        &self.task_types
    }

    async fn execute(&self, task: &Task, retry: Option<&RetryContext>) -> DomainResult<AdapterResult> {
        let command_line = task
            .backend_config
            .command
            .clone()
            .ok_or_else(|| DomainError::Adapter {
                class: FailureClass::ToolUnavailable,
                message: format!("task {} has no backend command", task.id),
            })?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(&command_line);
        command.args(&task.backend_config.args);
        if let Some(cwd) = &task.backend_config.cwd {
            command.current_dir(cwd);
        }
        command.env("FOREMAN_TASK_ID", task.id.to_string());
        command.env("FOREMAN_TASK_PROMPT", &task.prompt);
        if let Some(ctx) = retry {
            command.env("FOREMAN_ATTEMPT", ctx.attempt.to_string());
            if let Some(feedback) = &ctx.feedback {
                command.env("FOREMAN_FEEDBACK", feedback);
            }
        }
        for (key, value) in &task.backend_config.env {
            command.env(key, value);
        }
        command.kill_on_drop(true);

        let timeout = Duration::from_millis(task.backend_config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let started = Instant::now();

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DomainError::Adapter {
                    class: FailureClass::classify(-1, &e.to_string()),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DomainError::Adapter {
                    class: FailureClass::Timeout,
                    message: format!("command timed out after {}ms", timeout.as_millis()),
                })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        let combined = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n{stderr}")
        };

        // Structured output when the command prints a single JSON value.
        let structured = serde_json::from_str::<serde_json::Value>(combined.trim()).ok();

        Ok(AdapterResult {
            output: combined,
            structured,
            files_changed: Vec::new(),
            diff: None,
            exit_code,
            duration_ms,
            cost: None,
        })
    }

    async fn abort(&self, task_id: Uuid) {
        // Child processes are killed on drop; nothing to signal here.
        tracing::debug!(task_id = %task_id, "abort requested for shell adapter");
    }
}

/// Block agent that runs `block.agent` as a shell command.
///
/// Inputs are passed as JSON in `BLOCK_INPUTS`; stdout is parsed as a JSON
/// object of outputs. Blocks without an agent pass through with no outputs.
pub struct ShellBlockAgent {
    pub timeout_ms: u64,
}

impl Default for ShellBlockAgent {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[async_trait]
impl crate::services::dag_engine::BlockAgent for ShellBlockAgent {
    async fn run(
        &self,
        block: &crate::domain::models::BlockDef,
        inputs: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> DomainResult<std::collections::BTreeMap<String, serde_json::Value>> {
        let Some(agent) = &block.agent else {
            return Ok(std::collections::BTreeMap::new());
        };

        let inputs_json = serde_json::to_string(inputs)
            .map_err(|e| DomainError::Serialization(e.to_string()))?;
        let mut command = Command::new("sh");
        command.arg("-c").arg(agent);
        command.env("BLOCK_ID", &block.id);
        command.env("BLOCK_INPUTS", inputs_json);
        command.kill_on_drop(true);

        let timeout = Duration::from_millis(self.timeout_ms);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| DomainError::Adapter {
                class: FailureClass::Timeout,
                message: format!("block {} timed out after {}ms", block.id, timeout.as_millis()),
            })?
            .map_err(|e| DomainError::Adapter {
                class: FailureClass::classify(-1, &e.to_string()),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DomainError::Adapter {
                class: FailureClass::classify(output.status.code().unwrap_or(-1), &stderr),
                message: format!("block {} failed: {}", block.id, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outputs: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_str(stdout.trim()).unwrap_or_default();
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::BackendConfig;

    fn shell_task(command: &str) -> Task {
        Task::new("shell", "run it").with_backend_config(BackendConfig {
            command: Some(command.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let adapter = ShellAdapter::new(vec!["shell".to_string()]);
        let result = adapter.execute(&shell_task("echo hello"), None).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let adapter = ShellAdapter::new(vec!["shell".to_string()]);
        let result = adapter.execute(&shell_task("exit 3"), None).await.unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_class() {
        let adapter = ShellAdapter::new(vec!["shell".to_string()]);
        let mut task = shell_task("sleep 5");
        task.backend_config.timeout_ms = Some(50);
        let err = adapter.execute(&task, None).await.unwrap_err();
        match err {
            DomainError::Adapter { class, .. } => assert_eq!(class, FailureClass::Timeout),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_tool_unavailable() {
        let adapter = ShellAdapter::new(vec!["shell".to_string()]);
        let task = Task::new("shell", "no command configured");
        let err = adapter.execute(&task, None).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Adapter { class: FailureClass::ToolUnavailable, .. }
        ));
    }

    #[tokio::test]
    async fn json_stdout_becomes_structured() {
        let adapter = ShellAdapter::new(vec!["shell".to_string()]);
        let result = adapter
            .execute(&shell_task(r#"echo '{"ok": true}'"#), None)
            .await
            .unwrap();
        assert_eq!(result.structured.unwrap()["ok"], true);
    }
}

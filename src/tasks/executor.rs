//! Task dispatch.
//!
//! One handler per task type; every handler error is folded into a failed
//! [`TaskResult`] so the poll loop never sees a panic or a propagated error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::TaskError;
use crate::facts::HostFactProvider;
use crate::tasks::command::{DEFAULT_TIMEOUT, run_command};
use crate::tasks::{Task, TaskResult, TaskType, policy, script, software};

/// Dispatches tasks to their handlers and shapes the results.
pub struct TaskExecutor {
    facts: Arc<dyn HostFactProvider>,
    default_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(facts: Arc<dyn HostFactProvider>) -> Self {
        Self {
            facts,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute one task to completion. Always returns a result; failures
    /// are reported, never thrown.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let started_at = Utc::now();
        tracing::info!(task_id = %task.task_id, task_type = ?task.task_type, "executing task");

        match self.dispatch(task).await {
            Ok(payload) => TaskResult::completed(&task.task_id, started_at, payload),
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, "task failed: {e}");
                TaskResult::failed(&task.task_id, started_at, e.to_string())
            }
        }
    }

    async fn dispatch(&self, task: &Task) -> Result<serde_json::Value, TaskError> {
        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        match task.task_type {
            TaskType::RunCommand => {
                let command = param(task, "command")?;
                let out = run_command(command, timeout).await?;
                Ok(serde_json::json!({
                    "output": out.output,
                    "exit_code": out.exit_code,
                }))
            }
            TaskType::RunScript => {
                let body = param(task, "script")?;
                let interpreter = task.payload.get("interpreter").map(String::as_str);
                let out = script::run_script(body, interpreter, timeout).await?;
                Ok(serde_json::json!({
                    "output": out.output,
                    "exit_code": out.exit_code,
                }))
            }
            TaskType::InstallSoftware => {
                let manager = param(task, "manager")?;
                let package = param(task, "package")?;
                let out = software::install_software(manager, package, timeout).await?;
                Ok(serde_json::json!({
                    "output": out.output,
                    "exit_code": out.exit_code,
                    "package": package,
                }))
            }
            TaskType::ApplyPolicy => {
                let policy_type = param(task, "policy_type")?;
                policy::apply_policy(policy_type, &task.payload, timeout).await
            }
            TaskType::CollectData => Ok(self.facts.inventory().await),
            TaskType::SystemCheck => {
                let info = self.facts.device_info().await;
                Ok(serde_json::json!({
                    "metrics": self.facts.metrics().await,
                    "hostname": info.hostname,
                    "os_version": info.os_version,
                }))
            }
            TaskType::Unknown => Err(TaskError::UnsupportedType("unknown".to_string())),
        }
    }
}

fn param<'a>(task: &'a Task, key: &str) -> Result<&'a str, TaskError> {
    task.payload
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TaskError::MissingParameter(key.to_string()))
}

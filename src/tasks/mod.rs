//! Remote-directed tasks: model, dispatch, and handlers.
//!
//! Tasks arrive from the server on each poll and are handled at most once
//! locally; the server stays the durable source of truth for task state.
//! Handler failures become structured failed results, never panics.

mod command;
mod executor;
mod policy;
mod script;
mod software;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use command::{CommandOutput, is_denied, run_command};
pub use executor::TaskExecutor;

/// A unit of remote-directed work received from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    #[serde(alias = "id")]
    pub task_id: String,
    #[serde(alias = "type")]
    pub task_type: TaskType,
    #[serde(alias = "parameters", default)]
    pub payload: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(alias = "timeout", default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// The fixed set of task handlers. Anything else deserializes to `Unknown`
/// and is reported as a failed result rather than crashing the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RunCommand,
    RunScript,
    InstallSoftware,
    ApplyPolicy,
    CollectData,
    SystemCheck,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one task execution, reported back to the server. Not
/// persisted; does not survive process restart.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    /// 0.0 to 1.0.
    pub progress: f32,
    pub message: String,
    pub payload: serde_json::Value,
}

impl TaskResult {
    pub fn completed(task_id: &str, started_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Completed,
            started_at,
            progress: 1.0,
            message: "completed".to_string(),
            payload,
        }
    }

    pub fn failed(task_id: &str, started_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            started_at,
            progress: 1.0,
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_task_deserializes_server_aliases() {
        // The server is loose about field names; both spellings must work.
        let a: Task = serde_json::from_value(serde_json::json!({
            "task_id": "t1",
            "type": "run_command",
            "payload": {"command": "echo hi"},
            "priority": 5,
            "timeout": 30,
        }))
        .unwrap();
        assert_eq!(a.task_id, "t1");
        assert_eq!(a.task_type, TaskType::RunCommand);
        assert_eq!(a.payload.get("command").unwrap(), "echo hi");
        assert_eq!(a.timeout_secs, Some(30));

        let b: Task = serde_json::from_value(serde_json::json!({
            "id": "t2",
            "task_type": "collect_data",
            "parameters": {},
        }))
        .unwrap();
        assert_eq!(b.task_id, "t2");
        assert_eq!(b.task_type, TaskType::CollectData);
        assert_eq!(b.priority, 0);
    }

    #[test]
    fn test_unknown_type_deserializes() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "task_id": "t3",
            "type": "launch_missiles",
        }))
        .unwrap();
        assert_eq!(task.task_type, TaskType::Unknown);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
    }
}

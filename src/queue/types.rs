//! Task records and the views callers poll.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::TaskOutcome;
use crate::error::{ErrorKind, FleetError, FleetResult};
use crate::registry::AgentId;

pub type TaskId = Uuid;

/// What kind of work the caller wants from the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    Conversational,
    FileOperation,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeGeneration => "code_generation",
            TaskType::Conversational => "conversational",
            TaskType::FileOperation => "file_operation",
        }
    }

    pub fn parse(s: &str) -> FleetResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "code_generation" => Ok(TaskType::CodeGeneration),
            "conversational" => Ok(TaskType::Conversational),
            "file_operation" => Ok(TaskType::FileOperation),
            other => Err(FleetError::validation(
                "task_type",
                format!(
                    "unknown task type '{}' (expected code_generation, conversational, or file_operation)",
                    other
                ),
            )),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FleetError> for TaskError {
    fn from(e: &FleetError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// A queued unit of work for one agent.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub task_type: TaskType,
    pub message: String,
    /// Bound on the inference call for this task
    pub timeout: Duration,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub error: Option<TaskError>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set the first time the caller fetched the result
    pub fetched_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(agent_id: AgentId, task_type: TaskType, message: String, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_type,
            message,
            timeout,
            status: TaskStatus::Queued,
            outcome: None,
            error: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            fetched_at: None,
        }
    }

    /// Status and timestamps only.
    pub fn status_view(&self, queue_position: Option<usize>) -> TaskView {
        TaskView {
            task_id: self.id,
            agent_id: self.agent_id,
            task_type: self.task_type,
            status: self.status,
            queue_position,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: None,
            error: None,
        }
    }

    /// Everything, including the outcome and error detail.
    pub fn result_view(&self) -> TaskView {
        TaskView {
            outcome: self.outcome.clone(),
            error: self.error.clone(),
            ..self.status_view(None)
        }
    }
}

/// What callers see when they poll a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Tasks ahead of this one, while queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

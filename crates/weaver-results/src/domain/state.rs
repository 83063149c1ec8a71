//! State - タスクの状態
//!
//! # 状態遷移
//! - PENDING -> RECEIVED -> STARTED -> SUCCESS
//! - PENDING -> RECEIVED -> STARTED -> FAILURE
//! - RECEIVED / STARTED -> RETRY -> RECEIVED（ループ）
//!
//! 遷移は説明用で、setter は前の状態を検証しません（呼び出し側が順序を守る前提）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskUuid;
use super::result::TaskResult;
use super::signature::Signature;

/// Lifecycle status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Initial state of a task (waiting in the broker).
    Pending,

    /// Picked up by a worker.
    Received,

    /// Being executed.
    Started,

    /// Failed, scheduled for another attempt.
    Retry,

    /// Finished with results.
    Success,

    /// Finished with an error.
    Failure,
}

impl TaskStatus {
    /// SUCCESS or FAILURE.
    pub fn is_completed(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    pub fn is_success(self) -> bool {
        self == TaskStatus::Success
    }

    pub fn is_failure(self) -> bool {
        self == TaskStatus::Failure
    }

    pub fn is_initial(self) -> bool {
        self == TaskStatus::Pending
    }

    /// Whether `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Received)
                | (Received, Started)
                | (Received, Retry)
                | (Started, Retry)
                | (Started, Success)
                | (Started, Failure)
                | (Retry, Received)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Received => "RECEIVED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one task, keyed by `task_uuid`.
///
/// Every setter writes a fresh value (overwrite, never append).
/// `results` is only filled on SUCCESS and `error` only on FAILURE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_uuid: TaskUuid,

    #[serde(default)]
    pub task_name: String,

    pub state: TaskStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TaskResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set on first write, kept across later writes for the same task.
    pub created_at: DateTime<Utc>,
}

impl TaskState {
    fn new(signature: &Signature, state: TaskStatus) -> Self {
        Self {
            task_uuid: signature.uuid.clone(),
            task_name: signature.name.clone(),
            state,
            results: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn pending(signature: &Signature) -> Self {
        Self::new(signature, TaskStatus::Pending)
    }

    pub fn received(signature: &Signature) -> Self {
        Self::new(signature, TaskStatus::Received)
    }

    pub fn started(signature: &Signature) -> Self {
        Self::new(signature, TaskStatus::Started)
    }

    pub fn retry(signature: &Signature) -> Self {
        Self::new(signature, TaskStatus::Retry)
    }

    pub fn success(signature: &Signature, results: Vec<TaskResult>) -> Self {
        let mut state = Self::new(signature, TaskStatus::Success);
        state.results = results;
        state
    }

    pub fn failure(signature: &Signature, error: impl Into<String>) -> Self {
        let mut state = Self::new(signature, TaskStatus::Failure);
        state.error = Some(error.into());
        state
    }

    /// Carry over `created_at` (and the task name, if the prior one is set)
    /// from the state previously stored under the same task identifier.
    pub fn merge_prior(&mut self, prior: &TaskState) {
        self.created_at = prior.created_at;
        if !prior.task_name.is_empty() {
            self.task_name = prior.task_name.clone();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.state.is_failure()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::UpstreamFailed | Self::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Execution record of one task within one run. Only the executor mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempt_count: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

impl TaskState {
    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at.get_or_insert(now);
    }

    pub(crate) fn finish(
        &mut self,
        status: TaskStatus,
        attempt_count: u32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.attempt_count = attempt_count;
        self.last_error = last_error;
        self.finished_at = Some(now);
    }
}

/// Outcome of one triggered run: the overall status plus every task's
/// terminal state and last error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub task_states: BTreeMap<String, TaskState>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn state(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.get(task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.state(task_id).map(|state| state.status)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&str> {
        self.task_states
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Tasks that broke the chain themselves, excluding their casualties.
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks_with_status(TaskStatus::Failed)
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::resource::ResourceKind;
use crate::session::SessionInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// A unit of work pushed by a coordinator. `payload` is opaque to the agent
/// and handed untouched to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub kind: ResourceKind,
    /// Reclaim the task when it reports no progress for this long. 0 = never.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TaskRunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskRunState::Running)
    }
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRunState::Running => write!(f, "running"),
            TaskRunState::Succeeded => write!(f, "succeeded"),
            TaskRunState::Failed => write!(f, "failed"),
            TaskRunState::Killed => write!(f, "killed"),
        }
    }
}

/// Local bookkeeping for one task running on this node.
#[derive(Debug, Clone)]
pub struct TaskInProgress {
    pub work: WorkDescriptor,
    pub session: SessionInfo,
    pub state: TaskRunState,
    pub progress: f32,
    pub counters: BTreeMap<String, u64>,
    pub diagnostics: Option<String>,
    pub launched_at: Instant,
    pub last_progress: Instant,
}

impl TaskInProgress {
    pub fn new(work: WorkDescriptor, session: SessionInfo) -> Self {
        let now = Instant::now();
        Self {
            work,
            session,
            state: TaskRunState::Running,
            progress: 0.0,
            counters: BTreeMap::new(),
            diagnostics: None,
            launched_at: now,
            last_progress: now,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.work.task_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.work.job_id
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.state == TaskRunState::Running
            && self.work.timeout_ms > 0
            && now.duration_since(self.last_progress).as_millis() > u128::from(self.work.timeout_ms)
    }
}

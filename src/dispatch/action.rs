use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;
use crate::tasks::{JobId, TaskId, WorkDescriptor};

/// Control action pushed to this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    LaunchTask { work: WorkDescriptor },
    CommitTask { task_id: TaskId },
    KillJob { job_id: JobId },
    KillTask { task_id: TaskId },
    /// Not supported by this agent; logged and ignored
    ReinitTracker,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::LaunchTask { work } => write!(f, "launch task {}", work.task_id),
            Action::CommitTask { task_id } => write!(f, "commit task {}", task_id),
            Action::KillJob { job_id } => write!(f, "kill job {}", job_id),
            Action::KillTask { task_id } => write!(f, "kill task {}", task_id),
            Action::ReinitTracker => write!(f, "reinit tracker"),
        }
    }
}

/// An action together with the session it was issued under. Actions with
/// no session, or an incomplete one, come from an unknown coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAction {
    #[serde(default)]
    pub session: Option<SessionInfo>,
    pub action: Action,
}

impl SessionAction {
    pub fn new(session: SessionInfo, action: Action) -> Self {
        Self {
            session: Some(session),
            action,
        }
    }
}

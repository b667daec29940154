use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::SessionInfo;
use crate::tasks::{JobId, TaskId, WorkDescriptor};

/// Work the execution collaborator should start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub work: WorkDescriptor,
    pub session: SessionInfo,
}

/// Work the execution collaborator should tear down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CleanupAction {
    /// Kill every listed task and release the job's local state
    KillJob { job_id: JobId, tasks: Vec<TaskId> },
    KillTask { task_id: TaskId },
}

/// A job coordinator to be started on this node under a fresh context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorLaunch {
    pub context_id: Uuid,
    pub work: WorkDescriptor,
    pub session: SessionInfo,
}

/// Sending half of the queues feeding the execution collaborator.
#[derive(Debug, Clone)]
pub struct TaskQueues {
    launches: mpsc::UnboundedSender<LaunchRequest>,
    cleanups: mpsc::UnboundedSender<CleanupAction>,
    coordinators: mpsc::UnboundedSender<CoordinatorLaunch>,
}

#[derive(Debug)]
pub struct QueueReceivers {
    pub launches: mpsc::UnboundedReceiver<LaunchRequest>,
    pub cleanups: mpsc::UnboundedReceiver<CleanupAction>,
    pub coordinators: mpsc::UnboundedReceiver<CoordinatorLaunch>,
}

pub fn task_queues() -> (TaskQueues, QueueReceivers) {
    let (launch_tx, launch_rx) = mpsc::unbounded_channel();
    let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
    let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();
    (
        TaskQueues {
            launches: launch_tx,
            cleanups: cleanup_tx,
            coordinators: coordinator_tx,
        },
        QueueReceivers {
            launches: launch_rx,
            cleanups: cleanup_rx,
            coordinators: coordinator_rx,
        },
    )
}

impl TaskQueues {
    pub fn launch(&self, request: LaunchRequest) -> bool {
        let task_id = request.work.task_id.clone();
        if self.launches.send(request).is_err() {
            tracing::warn!(task_id = %task_id, "Launch queue closed, task dropped");
            return false;
        }
        true
    }

    pub fn cleanup(&self, action: CleanupAction) -> bool {
        if let Err(e) = self.cleanups.send(action) {
            tracing::warn!(action = ?e.0, "Cleanup queue closed, action dropped");
            return false;
        }
        true
    }

    pub fn start_coordinator(&self, launch: CoordinatorLaunch) -> bool {
        let job_id = launch.work.job_id.clone();
        if self.coordinators.send(launch).is_err() {
            tracing::warn!(job_id = %job_id, "Coordinator queue closed, start dropped");
            return false;
        }
        true
    }
}

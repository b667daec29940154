use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::ResourceKind;
use crate::tasks::{JobId, TaskId, TaskInProgress, TaskRunState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub kind: ResourceKind,
    pub state: TaskRunState,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl TaskStatusReport {
    pub fn from_task(tip: &TaskInProgress, include_counters: bool) -> Self {
        Self {
            task_id: tip.task_id().clone(),
            job_id: tip.job_id().clone(),
            kind: tip.work.kind,
            state: tip.state,
            progress: tip.progress,
            counters: include_counters.then(|| tip.counters.clone()),
            diagnostics: tip.diagnostics.clone(),
        }
    }
}

/// Payload of one coordinator heartbeat. An empty `tasks` list is valid and
/// is sent on slow heartbeats to probe an idle job's coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub node_name: String,
    /// Where the coordinator pushes actions to this node
    pub action_addr: String,
    pub tasks: Vec<TaskStatusReport>,
    pub include_counters: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub response_id: i32,
    /// Server-assigned delay before the next heartbeat
    pub heartbeat_interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInfo;
    use crate::tasks::WorkDescriptor;

    #[test]
    fn counters_only_when_requested() {
        let mut tip = TaskInProgress::new(
            WorkDescriptor {
                task_id: TaskId::from("t1"),
                job_id: JobId::from("j1"),
                kind: ResourceKind::Reduce,
                timeout_ms: 0,
                payload: serde_json::Value::Null,
            },
            SessionInfo::new("s1", "127.0.0.1:9000"),
        );
        tip.counters.insert("bytes".to_string(), 42);

        let without = TaskStatusReport::from_task(&tip, false);
        assert!(without.counters.is_none());
        let with = TaskStatusReport::from_task(&tip, true);
        assert_eq!(with.counters.unwrap().get("bytes"), Some(&42));
        assert_eq!(with.kind, ResourceKind::Reduce);
        assert_eq!(with.state, TaskRunState::Running);
    }
}

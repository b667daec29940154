use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::resource::{NodeIdentity, ResourceProvider};
use crate::session::SessionRegistry;
use crate::shutdown::Lifecycle;
use crate::tasks::{CleanupAction, JobId, TaskLedger, TaskQueues};

/// State shared by every loop and inbound handler of one agent.
///
/// Two locks live here: the session registry's and the task ledger's.
/// Neither is ever held across a network call.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub identity: Arc<NodeIdentity>,
    pub lifecycle: Lifecycle,
    pub registry: Arc<SessionRegistry>,
    pub ledger: Arc<Mutex<TaskLedger>>,
    pub resources: Arc<dyn ResourceProvider>,
    pub queues: TaskQueues,
    /// Monotonic time for expiry checks, wall time for status output
    last_cluster_heartbeat: Arc<RwLock<Option<(Instant, DateTime<Utc>)>>>,
}

impl AgentContext {
    pub fn new(
        config: AgentConfig,
        identity: NodeIdentity,
        resources: Arc<dyn ResourceProvider>,
        queues: TaskQueues,
    ) -> Self {
        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            lifecycle: Lifecycle::new(),
            registry: Arc::new(SessionRegistry::new()),
            ledger: Arc::new(Mutex::new(TaskLedger::new())),
            resources,
            queues,
            last_cluster_heartbeat: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn record_cluster_heartbeat(&self, at: Instant) {
        *self.last_cluster_heartbeat.write().await = Some((at, Utc::now()));
    }

    pub async fn last_cluster_heartbeat(&self) -> Option<Instant> {
        self.last_cluster_heartbeat.read().await.map(|(at, _)| at)
    }

    pub async fn last_cluster_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.last_cluster_heartbeat.read().await.map(|(_, wall)| wall)
    }

    /// Remove the job's tasks from the running set, tombstone the job and
    /// queue one cleanup covering every removed task.
    pub async fn kill_job(&self, job_id: &JobId) -> usize {
        let tasks = self.ledger.lock().await.remove_job(job_id);
        let removed = tasks.len();
        self.queues.cleanup(CleanupAction::KillJob {
            job_id: job_id.clone(),
            tasks,
        });
        removed
    }

    /// Kill every local job of the session, whether known from running
    /// tasks or from an active reporter. Returns the number of jobs killed.
    pub async fn purge_session(&self, handle: &str) -> usize {
        let mut jobs = self.ledger.lock().await.jobs_for_session(handle);
        jobs.extend(self.registry.jobs_for_session(handle).await);

        for job_id in &jobs {
            let tasks = self.kill_job(job_id).await;
            tracing::info!(session = handle, job_id = %job_id, tasks, "Purging job of session");
        }
        jobs.len()
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::dispatch::{Action, SessionAction};
use crate::reporter::ReporterManager;
use crate::session::SessionInfo;
use crate::tasks::ledger::Rejection;
use crate::tasks::{CleanupAction, CoordinatorLaunch, LaunchRequest, TaskInProgress, WorkDescriptor};

/// Point-in-time view of the agent for the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub node_name: String,
    pub state: String,
    pub alive: bool,
    pub accepting_new_tasks: bool,
    pub running_tasks: usize,
    pub reporters: usize,
    pub last_cluster_heartbeat: Option<DateTime<Utc>>,
}

/// Handles pushed actions and liveness/session queries.
///
/// Actions from an unknown or blacklisted session are dropped with a warning
/// before they reach the execution queues; the caller never sees an error.
pub struct Dispatcher {
    ctx: AgentContext,
    reporters: Arc<ReporterManager>,
}

impl Dispatcher {
    pub fn new(ctx: AgentContext, reporters: Arc<ReporterManager>) -> Self {
        Self { ctx, reporters }
    }

    /// True while the last successful cluster heartbeat is within the node
    /// expiry window.
    pub async fn is_alive(&self) -> bool {
        match self.ctx.last_cluster_heartbeat().await {
            Some(at) => at.elapsed() <= self.ctx.config.node_expiry_interval(),
            None => false,
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let (accepting_new_tasks, running_tasks) = {
            let ledger = self.ctx.ledger.lock().await;
            (ledger.accepting_new_tasks(), ledger.len())
        };
        AgentStatus {
            node_name: self.ctx.identity.name.clone(),
            state: self.ctx.lifecycle.state().to_string(),
            alive: self.is_alive().await,
            accepting_new_tasks,
            running_tasks,
            reporters: self.ctx.registry.reporter_count().await,
            last_cluster_heartbeat: self.ctx.last_cluster_heartbeat_at().await,
        }
    }

    /// Dispatch each action in order. Returns how many were acted on.
    pub async fn submit_actions(&self, actions: Vec<SessionAction>) -> usize {
        let mut dispatched = 0;
        for SessionAction { session, action } in actions {
            if self.ctx.lifecycle.is_shutting_down() {
                tracing::warn!(action = %action, "Agent shutting down, action ignored");
                continue;
            }
            let session = match known_session(session) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(action = %action, error = %e, "Received action from unknown coordinator, ignored");
                    continue;
                }
            };
            if self.ctx.registry.is_blacklisted(&session.handle).await {
                tracing::warn!(
                    action = %action,
                    session = %session.handle,
                    "Received action from blacklisted session, ignored"
                );
                continue;
            }
            if self.dispatch(session, action).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    async fn dispatch(&self, session: SessionInfo, action: Action) -> bool {
        match action {
            Action::LaunchTask { work } => self.launch(work, session).await,
            Action::CommitTask { task_id } => {
                if self.ctx.ledger.lock().await.commit(task_id.clone()) {
                    tracing::info!(task_id = %task_id, "Received commit task action");
                } else {
                    tracing::debug!(task_id = %task_id, "Duplicate commit task action");
                }
                true
            }
            Action::KillJob { job_id } => {
                tracing::info!(job_id = %job_id, session = %session.handle, "Received kill job action");
                self.ctx.kill_job(&job_id).await;
                true
            }
            Action::KillTask { task_id } => {
                tracing::info!(task_id = %task_id, "Received kill task action");
                self.ctx.queues.cleanup(CleanupAction::KillTask { task_id })
            }
            Action::ReinitTracker => {
                tracing::error!(
                    coordinator = %session.coordinator_addr,
                    "Received unsupported reinit tracker action, ignored"
                );
                false
            }
        }
    }

    /// Record the task and queue it for execution. The job's reporter is
    /// started in the background so a slow coordinator never holds up the
    /// rest of the batch.
    async fn launch(&self, work: WorkDescriptor, session: SessionInfo) -> bool {
        let job_id = work.job_id.clone();
        let added = self
            .ctx
            .ledger
            .lock()
            .await
            .add_task(TaskInProgress::new(work.clone(), session.clone()));
        match added {
            Ok(()) => {}
            Err(Rejection::AlreadyRunning) => {
                tracing::debug!(task_id = %work.task_id, "Task already running, launch ignored");
                return false;
            }
            Err(Rejection::JobKilled) => {
                tracing::warn!(task_id = %work.task_id, job_id = %job_id, "Launch for killed job, ignored");
                return false;
            }
            Err(Rejection::SessionBlacklisted) => {
                tracing::warn!(
                    task_id = %work.task_id,
                    session = %session.handle,
                    "Launch for blacklisted session, ignored"
                );
                return false;
            }
            Err(Rejection::NotAccepting) => {
                tracing::warn!(task_id = %work.task_id, "Not accepting new tasks, launch ignored");
                return false;
            }
        }

        tracing::info!(task_id = %work.task_id, job_id = %job_id, "Received launch task action");
        let task_id = work.task_id.clone();
        if !self.ctx.queues.launch(LaunchRequest {
            work,
            session: session.clone(),
        }) {
            self.ctx.ledger.lock().await.remove_task(&task_id);
            return false;
        }
        self.reporters.start_in_background(job_id, session).await;
        true
    }

    /// Queue a coordinator start for the job under a fresh context. Returns
    /// the context id, or `None` if the request was dropped.
    pub async fn start_coordinator_for_job(
        &self,
        work: WorkDescriptor,
        session: SessionInfo,
    ) -> Option<Uuid> {
        if self.ctx.lifecycle.is_shutting_down() {
            tracing::warn!(job_id = %work.job_id, "Agent shutting down, coordinator start ignored");
            return None;
        }
        if !session.is_complete() || self.ctx.registry.is_blacklisted(&session.handle).await {
            tracing::warn!(
                job_id = %work.job_id,
                session = %session.handle,
                "Coordinator start for unknown or blacklisted session, ignored"
            );
            return None;
        }

        let context_id = Uuid::new_v4();
        tracing::info!(
            job_id = %work.job_id,
            coordinator = %session.coordinator_addr,
            context_id = %context_id,
            "Processing start coordinator request"
        );
        self.ctx
            .queues
            .start_coordinator(CoordinatorLaunch {
                context_id,
                work,
                session,
            })
            .then_some(context_id)
    }

    /// Permanently exclude a session and purge its local jobs. Returns false
    /// if it was already blacklisted.
    pub async fn blacklist_session(&self, handle: &str) -> bool {
        // The ledger refuses the session's tasks before the purge runs, so a
        // launch racing with this call is either purged or never added.
        let first = self.ctx.ledger.lock().await.blacklist_session(handle);
        self.ctx.registry.blacklist(handle).await;
        if !first {
            return false;
        }
        tracing::info!(session = handle, "Session blacklisted");
        self.ctx.purge_session(handle).await;
        true
    }

    pub async fn purge_session(&self, handle: &str) -> usize {
        self.ctx.purge_session(handle).await
    }
}

fn known_session(session: Option<SessionInfo>) -> Result<SessionInfo> {
    match session {
        Some(session) if session.is_complete() => Ok(session),
        Some(session) => Err(AgentError::InvalidSession(format!(
            "handle '{}', coordinator '{}'",
            session.handle, session.coordinator_addr
        ))),
        None => Err(AgentError::InvalidSession("missing".to_string())),
    }
}

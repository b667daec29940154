//! Per-job status reporting to coordinators.
//!
//! Every job with tasks on this node gets one [`JobReporter`] loop talking to
//! that job's coordinator. [`ReporterManager`] starts and stops them and keeps
//! the registry invariant of at most one reporter per job.

mod job_reporter;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::rpc::CoordinatorConnector;
use crate::session::SessionInfo;
use crate::tasks::JobId;

pub use job_reporter::JobReporter;

/// Registry entry for a running reporter.
#[derive(Debug)]
pub struct ReporterHandle {
    pub job_id: JobId,
    pub session: SessionInfo,
    pub instance: Uuid,
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl ReporterHandle {
    pub fn new(job_id: JobId, session: SessionInfo, stop: CancellationToken) -> Self {
        Self {
            job_id,
            session,
            instance: Uuid::new_v4(),
            stop,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Ask the reporter to exit. Interrupts its wait; an in-flight RPC is
    /// allowed to finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Cut the reporter's current wait short. A wake fired while the
    /// reporter is busy is kept and consumed by its next wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

pub struct ReporterManager {
    ctx: AgentContext,
    connector: Arc<dyn CoordinatorConnector>,
    tracker: TaskTracker,
    /// Jobs with a background start in flight
    starting: Mutex<HashSet<JobId>>,
}

impl ReporterManager {
    pub fn new(ctx: AgentContext, connector: Arc<dyn CoordinatorConnector>) -> Self {
        Self {
            ctx,
            connector,
            tracker: TaskTracker::new(),
            starting: Mutex::new(HashSet::new()),
        }
    }

    /// Start reporting for a job without waiting for the coordinator
    /// connection. At most one start per job is in flight. If the connection
    /// fails the job is killed; if the job was killed or its session purged
    /// while connecting, the new reporter is stopped again.
    ///
    /// Returns false if the job already has a reporter or a pending start.
    pub async fn start_in_background(self: &Arc<Self>, job_id: JobId, session: SessionInfo) -> bool {
        if self.ctx.registry.contains_reporter(&job_id).await {
            return false;
        }
        if !self.starting.lock().await.insert(job_id.clone()) {
            return false;
        }

        let manager = self.clone();
        self.tracker.spawn(async move {
            manager.start_or_kill(&job_id, &session).await;
            manager.starting.lock().await.remove(&job_id);
        });
        true
    }

    async fn start_or_kill(&self, job_id: &JobId, session: &SessionInfo) {
        if self.ctx.ledger.lock().await.is_job_killed(job_id) {
            return;
        }

        let token = self.ctx.lifecycle.token();
        let started = tokio::select! {
            _ = token.cancelled() => return,
            started = self.start(job_id, session) => started,
        };
        match started {
            Ok(true) => {
                // Killed while we were connecting
                if self.ctx.ledger.lock().await.is_job_killed(job_id) {
                    self.stop(job_id).await;
                }
            }
            Ok(false) => {}
            Err(AgentError::Interrupted) => {}
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    session = %session.handle,
                    error = %e,
                    "Cannot report to coordinator, killing job"
                );
                self.ctx.kill_job(job_id).await;
            }
        }
    }

    /// Start reporting for a job. Returns `Ok(false)` if a reporter already
    /// exists. A failed connection is returned to the caller and nothing is
    /// registered.
    pub async fn start(&self, job_id: &JobId, session: &SessionInfo) -> Result<bool> {
        if self.ctx.lifecycle.is_shutting_down() {
            return Err(AgentError::Interrupted);
        }
        if self.ctx.registry.contains_reporter(job_id).await {
            return Ok(false);
        }

        let addr = session.coordinator_addr.as_str();
        let connect = self.connector.connect(addr);
        let client = match tokio::time::timeout(self.ctx.config.coordinator_connect_timeout(), connect)
            .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                tracing::error!(
                    job_id = %job_id,
                    session = %session.handle,
                    coordinator = addr,
                    error = %e,
                    "Failed to connect to coordinator"
                );
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    job_id = %job_id,
                    session = %session.handle,
                    coordinator = addr,
                    "Timed out connecting to coordinator"
                );
                return Err(AgentError::CoordinatorUnreachable(addr.to_string()));
            }
        };

        let handle = ReporterHandle::new(
            job_id.clone(),
            session.clone(),
            self.ctx.lifecycle.token().child_token(),
        );
        let reporter = JobReporter::new(self.ctx.clone(), &handle, client.clone());

        if self.ctx.registry.register_reporter(handle).await.is_err() {
            // Lost a race with a concurrent start for the same job
            client.close().await;
            return Ok(false);
        }

        tracing::info!(job_id = %job_id, session = %session.handle, coordinator = addr, "Started job reporter");
        self.tracker.spawn(reporter.run());
        Ok(true)
    }

    /// Stop and unregister the job's reporter.
    pub async fn stop(&self, job_id: &JobId) -> bool {
        match self.ctx.registry.remove_reporter(job_id).await {
            Some(handle) => {
                tracing::info!(job_id = %job_id, coordinator = %handle.session.coordinator_addr, "Shutting down job reporter");
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub async fn wake(&self, job_id: &JobId) -> bool {
        self.ctx.registry.wake_reporter(job_id).await
    }

    pub async fn is_reporting(&self, job_id: &JobId) -> bool {
        self.ctx.registry.contains_reporter(job_id).await
    }

    /// Signal every reporter and wait up to `grace` for them to exit.
    pub async fn stop_all(&self, grace: Duration) {
        let handles = self.ctx.registry.drain_reporters().await;
        for handle in &handles {
            handle.stop();
        }
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Job reporters still busy after shutdown grace period"
            );
        }
    }
}

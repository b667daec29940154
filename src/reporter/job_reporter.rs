use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::reporter::ReporterHandle;
use crate::rpc::{report_failure_best_effort, CoordinatorClient, TaskStatusReport, TrackerStatus};
use crate::session::SessionInfo;
use crate::tasks::{JobId, TaskId, TaskInProgress};

/// Heartbeat loop from this node to one job's coordinator.
///
/// Each tick waits for the server-assigned interval (or an early wake from
/// a finished task), snapshots the session's tasks under the ledger lock,
/// releases the lock and sends. Heartbeats are strictly sequential and the
/// response id returned by one call is forwarded on the next.
pub struct JobReporter {
    ctx: AgentContext,
    job_id: JobId,
    session: SessionInfo,
    instance: Uuid,
    stop: CancellationToken,
    wake: Arc<Notify>,
    client: Option<Arc<dyn CoordinatorClient>>,

    heartbeat_interval: Duration,
    response_id: i32,
    just_inited: bool,
    /// End of the previous tick, paces the next one
    last_tick: Option<Instant>,
    /// Last heartbeat that reached the coordinator, drives the slow heartbeat
    last_sent: Instant,
    last_counter_update: Option<Instant>,
}

impl JobReporter {
    pub(crate) fn new(
        ctx: AgentContext,
        handle: &ReporterHandle,
        client: Arc<dyn CoordinatorClient>,
    ) -> Self {
        let heartbeat_interval = ctx.config.default_job_heartbeat_interval();
        Self {
            ctx,
            job_id: handle.job_id.clone(),
            session: handle.session.clone(),
            instance: handle.instance,
            stop: handle.stop.clone(),
            wake: handle.wake.clone(),
            client: Some(client),
            heartbeat_interval,
            response_id: -1,
            just_inited: true,
            last_tick: None,
            last_sent: Instant::now(),
            last_counter_update: None,
        }
    }

    pub async fn run(mut self) {
        match self.report_loop().await {
            Ok(()) | Err(AgentError::Interrupted) => {
                tracing::info!(job_id = %self.job_id, "Job reporter stopped");
            }
            Err(e) => self.handle_failure(e).await,
        }
        self.release().await;
    }

    async fn report_loop(&mut self) -> Result<()> {
        loop {
            self.wait_for_tick().await?;

            if self.just_inited {
                self.check_build_version().await?;
            }

            let tasks = {
                let ledger = self.ctx.ledger.lock().await;
                ledger.tasks_for_session(&self.session.handle)
            };

            let slow_due = self.last_sent.elapsed() > self.ctx.config.slow_heartbeat_ceiling();
            if !tasks.is_empty() || slow_due {
                self.ctx.resources.check_local_dirs()?;
                self.send_heartbeat(&tasks).await?;
            }

            self.last_tick = Some(Instant::now());
            self.just_inited = false;
        }
    }

    async fn wait_for_tick(&mut self) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(AgentError::Interrupted);
        }
        let wait = match self.last_tick {
            Some(last) => self.heartbeat_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        if wait.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(AgentError::Interrupted),
            _ = self.wake.notified() => {
                tracing::trace!(job_id = %self.job_id, "Job reporter woken early");
                Ok(())
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn check_build_version(&self) -> Result<()> {
        let client = self.client()?;
        let remote = client.build_version().await?;
        let local = &self.ctx.config.build_version;
        if self.ctx.config.version_check_enabled && remote != *local {
            let msg = format!(
                "Shutting down. Incompatible build version. Coordinator's: {}, node's: {}",
                remote, local
            );
            tracing::error!(job_id = %self.job_id, coordinator = %self.session.coordinator_addr, "{}", msg);
            report_failure_best_effort(client.as_ref(), &self.ctx.identity.name, None, &msg).await;
            return Err(AgentError::VersionMismatch {
                coordinator: remote,
                local: local.clone(),
            });
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self, tasks: &[TaskInProgress]) -> Result<()> {
        let client = self.client()?;
        let now = Instant::now();
        let include_counters = self
            .last_counter_update
            .map_or(true, |t| now.duration_since(t) >= self.ctx.config.counter_update_interval());
        if include_counters {
            self.last_counter_update = Some(now);
        }

        let status = TrackerStatus {
            node_name: self.ctx.identity.name.clone(),
            action_addr: self.ctx.identity.app_info(),
            tasks: tasks
                .iter()
                .map(|tip| TaskStatusReport::from_task(tip, include_counters))
                .collect(),
            include_counters,
        };

        tracing::debug!(
            job_id = %self.job_id,
            coordinator = %self.session.coordinator_addr,
            response_id = self.response_id,
            tasks = status.tasks.len(),
            "Coordinator heartbeat"
        );

        let response = client.heartbeat(&status, self.response_id).await?;
        self.response_id = response.response_id;
        if response.heartbeat_interval_ms > 0 {
            self.heartbeat_interval = Duration::from_millis(response.heartbeat_interval_ms);
        }
        self.last_sent = Instant::now();

        let reported: Vec<TaskId> = status
            .tasks
            .iter()
            .filter(|t| t.state.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();
        if !reported.is_empty() {
            self.ctx.ledger.lock().await.forget_reported(&reported);
        }
        Ok(())
    }

    async fn handle_failure(&self, err: AgentError) {
        match &err {
            AgentError::DiskError(_) => {
                let msg = format!("Exiting job reporter for disk error: {}", err);
                tracing::error!(job_id = %self.job_id, "{}", msg);
                if let Some(client) = &self.client {
                    report_failure_best_effort(
                        client.as_ref(),
                        &self.ctx.identity.name,
                        Some("DiskError"),
                        &msg,
                    )
                    .await;
                }
            }
            AgentError::VersionMismatch { .. } => {}
            _ => {
                tracing::error!(
                    job_id = %self.job_id,
                    coordinator = %self.session.coordinator_addr,
                    session = %self.session.handle,
                    error = %err,
                    "Error reporting to coordinator, purging session"
                );
            }
        }
        self.ctx.purge_session(&self.session.handle).await;
    }

    /// Close the coordinator client and drop this reporter's registry entry.
    async fn release(&mut self) {
        if let Some(client) = self.client.take() {
            client.close().await;
        }
        self.ctx
            .registry
            .remove_reporter_instance(&self.job_id, self.instance)
            .await;
    }

    fn client(&self) -> Result<Arc<dyn CoordinatorClient>> {
        self.client
            .clone()
            .ok_or_else(|| AgentError::CoordinatorUnreachable(self.session.coordinator_addr.clone()))
    }
}

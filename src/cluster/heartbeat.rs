use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::error::Result;
use crate::resource::{ResourceReport, ResourceSnapshot};
use crate::rpc::{ClusterManagerClient, ClusterManagerConnector};
use crate::server::BoundListener;
use crate::tasks::{CleanupAction, TaskId};

/// Heartbeat loop from this node to the cluster resource manager.
///
/// The only component allowed to decide that the node has been excluded from
/// the cluster. Runs until the agent shuts down:
///
/// 1. Waits until the heartbeat interval has passed since the last
///    successful report (never early)
/// 2. Builds a [`ResourceReport`] from a fresh snapshot
/// 3. Connects lazily and sends the report
/// 4. On success resets the failure count and runs local maintenance
///
/// Transport failures close the client and back off; after
/// `max_cluster_heartbeat_failures` in a row the agent shuts down. A
/// disallowed response shuts the agent down immediately.
pub struct ClusterHeartbeat {
    ctx: AgentContext,
    connector: Arc<dyn ClusterManagerConnector>,
    client: Mutex<Option<Arc<dyn ClusterManagerClient>>>,
    failures: u32,
    callback_listener: Option<Arc<BoundListener>>,
}

impl ClusterHeartbeat {
    pub fn new(ctx: AgentContext, connector: Arc<dyn ClusterManagerConnector>) -> Self {
        Self {
            ctx,
            connector,
            client: Mutex::new(None),
            failures: 0,
            callback_listener: None,
        }
    }

    /// Re-validate this listener's port against the node identity after
    /// every successful heartbeat.
    pub fn with_callback_listener(mut self, listener: Arc<BoundListener>) -> Self {
        self.callback_listener = Some(listener);
        self
    }

    pub async fn run(mut self) {
        let token = self.ctx.lifecycle.token();
        let interval = self.ctx.config.cluster_heartbeat_interval();
        let mut last_success: Option<Instant> = None;

        tracing::info!(
            cluster_manager = %self.ctx.config.cluster_manager_addr,
            interval_ms = interval.as_millis() as u64,
            "Starting cluster heartbeat loop"
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            if let Some(last) = last_success {
                let wait = interval.saturating_sub(last.elapsed());
                if !sleep_or_cancel(&token, wait).await {
                    tracing::info!("Cluster heartbeat interrupted, closing down");
                    break;
                }
            }

            match self.heartbeat_once().await {
                Ok(snapshot) => {
                    self.failures = 0;
                    let now = Instant::now();
                    last_success = Some(now);
                    self.ctx.record_cluster_heartbeat(now).await;
                    self.maintenance(&snapshot).await;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Cluster manager has excluded this node, shutting down");
                    self.ctx.lifecycle.begin_shutdown("node disallowed by cluster manager");
                    break;
                }
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    self.close_client().await;
                    self.failures += 1;
                    let max = self.ctx.config.max_cluster_heartbeat_failures;
                    tracing::error!(
                        error = %e,
                        retry = self.failures,
                        backoff_ms = self.ctx.config.cluster_retry_backoff_ms,
                        "Error connecting to cluster manager"
                    );
                    if self.failures >= max {
                        tracing::error!(
                            attempts = self.failures,
                            "Cannot reach cluster manager, shutting down"
                        );
                        self.ctx.lifecycle.begin_shutdown("cluster manager unreachable");
                        break;
                    }
                    if !sleep_or_cancel(&token, self.ctx.config.cluster_retry_backoff()).await {
                        break;
                    }
                }
            }
        }

        self.close_client().await;
        tracing::info!("Cluster heartbeat loop exited");
    }

    async fn heartbeat_once(&self) -> Result<ResourceSnapshot> {
        let snapshot = self.ctx.resources.snapshot();
        let report = ResourceReport::build(
            &self.ctx.identity,
            &snapshot,
            self.ctx.config.network_used_mbps,
        );
        tracing::debug!(
            node = %self.ctx.identity.name,
            cpu_usage = report.cpu_usage_percent,
            memory_used_mb = report.used.memory_mb,
            "Cluster manager heartbeat"
        );

        let client = self.client().await?;
        client.node_heartbeat(&self.ctx.identity, &report).await?;
        Ok(snapshot)
    }

    async fn client(&self) -> Result<Arc<dyn ClusterManagerClient>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let addr = &self.ctx.config.cluster_manager_addr;
        tracing::info!(addr = %addr, "Connecting to cluster manager");
        let client = self.connector.connect(addr).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn close_client(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Local upkeep after a successful heartbeat: reclaim stuck tasks,
    /// apply the disk throttle, re-check the callback port.
    async fn maintenance(&self, snapshot: &ResourceSnapshot) {
        let reclaimed: Vec<TaskId> = {
            let mut ledger = self.ctx.ledger.lock().await;
            let reclaimed = ledger.reclaim_timed_out(Instant::now());

            let min_free = self.ctx.config.min_free_disk_gb;
            let disk_low = min_free > 0 && snapshot.disk_free_gb() < min_free;
            if disk_low && ledger.accepting_new_tasks() {
                tracing::warn!(
                    free_gb = snapshot.disk_free_gb(),
                    min_free_gb = min_free,
                    "Low disk space, no longer accepting new tasks"
                );
                ledger.set_accepting_new_tasks(false);
            } else if !disk_low && !ledger.accepting_new_tasks() && ledger.is_idle() {
                tracing::info!("Node idle and disk recovered, accepting new tasks");
                ledger.set_accepting_new_tasks(true);
            }
            reclaimed
        };

        for task_id in reclaimed {
            tracing::warn!(task_id = %task_id, "Task timed out without progress, reclaiming");
            self.ctx.queues.cleanup(CleanupAction::KillTask { task_id });
        }

        if let Some(listener) = &self.callback_listener {
            let expected = self.ctx.identity.callback_addr.port();
            match listener.current_port() {
                Some(port) if port == expected => {}
                Some(port) => {
                    tracing::error!(expected, actual = port, "Callback server port changed");
                }
                None => {
                    tracing::error!(expected, "Callback server listener is gone");
                }
            }
        }
    }
}

/// Sleep unless the token fires first. Returns false when cancelled.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

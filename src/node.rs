use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::cluster::ClusterHeartbeat;
use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::dispatch::Dispatcher;
use crate::error::{AgentError, Result};
use crate::reporter::ReporterManager;
use crate::resource::{NodeIdentity, ResourceProvider};
use crate::rpc::{ClusterManagerConnector, CoordinatorConnector};
use crate::server::{self, BoundListener};
use crate::shutdown::{AgentState, Lifecycle};
use crate::tasks::{task_queues, CleanupAction, QueueReceivers, TaskId, TaskRunState};

/// How long shutdown waits for each component before giving up on it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Outbound collaborators the agent is built on.
#[derive(Clone)]
pub struct AgentDeps {
    pub resources: Arc<dyn ResourceProvider>,
    pub cluster_manager: Arc<dyn ClusterManagerConnector>,
    pub coordinators: Arc<dyn CoordinatorConnector>,
}

/// Halves handed to the loops when the agent starts.
struct Startup {
    callback: TcpListener,
    action: TcpListener,
    cleanups: mpsc::UnboundedReceiver<CleanupAction>,
}

/// Compute-node agent that orchestrates all components.
pub struct NodeAgent {
    ctx: AgentContext,
    dispatcher: Arc<Dispatcher>,
    reporters: Arc<ReporterManager>,
    cluster_manager: Arc<dyn ClusterManagerConnector>,
    callback_listener: Arc<BoundListener>,
    action_listener: Arc<BoundListener>,
    startup: Mutex<Option<Startup>>,
    executor_cleanups: mpsc::UnboundedSender<CleanupAction>,
}

impl NodeAgent {
    /// Bind both inbound servers on ephemeral ports of `bind_host` and wire
    /// the agent. Returns the agent and the queues the execution
    /// collaborator drains. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if either listener cannot be bound.
    pub fn bind(config: AgentConfig, deps: AgentDeps) -> Result<(Self, QueueReceivers)> {
        let (callback_listener, callback) = BoundListener::bind(SocketAddr::new(config.bind_host, 0))?;
        let (action_listener, action) = BoundListener::bind(SocketAddr::new(config.bind_host, 0))?;

        let snapshot = deps.resources.snapshot();
        let identity = NodeIdentity::new(
            config.node_name.clone(),
            callback_listener.local_addr(),
            action_listener.local_addr(),
            &snapshot,
            config.network_capacity_mbps,
        );
        tracing::info!(
            node = %identity.name,
            callback_addr = %identity.callback_addr,
            action_addr = %identity.action_addr,
            cpus = identity.total.num_cpus,
            memory_mb = identity.total.memory_mb,
            disk_gb = identity.total.disk_gb,
            "Node agent bound"
        );

        // Cleanups pass through the agent's own loop before reaching the
        // execution collaborator.
        let (queues, receivers) = task_queues();
        let (executor_cleanups, executor_cleanup_rx) = mpsc::unbounded_channel();
        let QueueReceivers {
            launches,
            cleanups,
            coordinators,
        } = receivers;

        let ctx = AgentContext::new(config, identity, deps.resources, queues);
        let reporters = Arc::new(ReporterManager::new(ctx.clone(), deps.coordinators));
        let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), reporters.clone()));

        let agent = Self {
            ctx,
            dispatcher,
            reporters,
            cluster_manager: deps.cluster_manager,
            callback_listener: Arc::new(callback_listener),
            action_listener: Arc::new(action_listener),
            startup: Mutex::new(Some(Startup {
                callback,
                action,
                cleanups,
            })),
            executor_cleanups,
        };
        let execution = QueueReceivers {
            launches,
            cleanups: executor_cleanup_rx,
            coordinators,
        };
        Ok((agent, execution))
    }

    /// Run every component until shutdown, then tear down in order:
    /// inbound servers, job reporters, cluster heartbeat, cleanup loop.
    ///
    /// This is the main entry point. It spawns:
    /// 1. The callback server for the cluster manager
    /// 2. The action server for job coordinators
    /// 3. The cluster heartbeat loop
    /// 4. The task cleanup loop
    ///
    /// and returns once the agent is `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent was already started.
    pub async fn run(&self) -> Result<()> {
        let startup = self
            .startup
            .lock()
            .await
            .take()
            .ok_or_else(|| AgentError::Internal("node agent already started".to_string()))?;

        if !self.ctx.lifecycle.mark_running() {
            // Shut down before it ever ran
            self.close_listeners();
            self.ctx.lifecycle.mark_stopped();
            return Ok(());
        }

        let token = self.ctx.lifecycle.token();
        let server_config = &self.ctx.config.server;

        let callback = tokio::spawn(server::serve(
            "callback",
            startup.callback,
            server::callback_router(self.dispatcher.clone(), server_config),
            token.clone(),
        ));
        let action = tokio::spawn(server::serve(
            "action",
            startup.action,
            server::action_router(self.dispatcher.clone(), server_config),
            token.clone(),
        ));
        let heartbeat = tokio::spawn(
            ClusterHeartbeat::new(self.ctx.clone(), self.cluster_manager.clone())
                .with_callback_listener(self.callback_listener.clone())
                .run(),
        );
        let cleanup = tokio::spawn(cleanup_loop(
            self.ctx.clone(),
            self.reporters.clone(),
            startup.cleanups,
            self.executor_cleanups.clone(),
        ));

        tracing::info!(node = %self.ctx.identity.name, "Node agent running");
        token.cancelled().await;

        join_or_abort("callback server", callback).await;
        join_or_abort("action server", action).await;
        self.reporters.stop_all(SHUTDOWN_GRACE).await;
        join_or_abort("cluster heartbeat", heartbeat).await;
        join_or_abort("cleanup loop", cleanup).await;

        self.close_listeners();
        self.ctx.lifecycle.mark_stopped();
        Ok(())
    }

    /// Start shutting down. Idempotent; `run` returns once teardown is done.
    pub fn shutdown(&self) {
        self.ctx.lifecycle.begin_shutdown("shutdown requested");
    }

    pub async fn wait_stopped(&self) {
        self.ctx.lifecycle.wait_stopped().await;
    }

    pub fn state(&self) -> AgentState {
        self.ctx.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.ctx.lifecycle
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn reporters(&self) -> Arc<ReporterManager> {
        self.reporters.clone()
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Record a task's terminal state and wake its job reporter so the
    /// coordinator hears about it before the next scheduled tick.
    pub async fn task_finished(
        &self,
        task_id: &TaskId,
        state: TaskRunState,
        diagnostics: Option<String>,
    ) -> bool {
        if !state.is_terminal() {
            tracing::warn!(task_id = %task_id, "Ignoring non-terminal finish");
            return false;
        }
        let job_id = self.ctx.ledger.lock().await.finish(task_id, state, diagnostics);
        match job_id {
            Some(job_id) => {
                tracing::info!(task_id = %task_id, job_id = %job_id, state = %state, "Task finished");
                self.reporters.wake(&job_id).await;
                true
            }
            None => {
                tracing::debug!(task_id = %task_id, "Finish for unknown or finished task");
                false
            }
        }
    }

    pub async fn update_task_progress(
        &self,
        task_id: &TaskId,
        progress: f32,
        counters: BTreeMap<String, u64>,
    ) -> bool {
        self.ctx
            .ledger
            .lock()
            .await
            .update_progress(task_id, progress, counters)
    }

    fn close_listeners(&self) {
        self.callback_listener.close();
        self.action_listener.close();
    }
}

/// Drain the cleanup queue: release local state for each action, then hand
/// it to the execution collaborator.
async fn cleanup_loop(
    ctx: AgentContext,
    reporters: Arc<ReporterManager>,
    mut cleanups: mpsc::UnboundedReceiver<CleanupAction>,
    executor: mpsc::UnboundedSender<CleanupAction>,
) {
    let token = ctx.lifecycle.token();
    loop {
        let action = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            action = cleanups.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        match &action {
            CleanupAction::KillJob { job_id, tasks } => {
                reporters.stop(job_id).await;
                // Catches tasks added after the kill was queued
                let late = ctx.ledger.lock().await.remove_job(job_id);
                tracing::info!(
                    job_id = %job_id,
                    tasks = tasks.len() + late.len(),
                    "Purged job"
                );
            }
            CleanupAction::KillTask { task_id } => {
                let job_id = {
                    let mut ledger = ctx.ledger.lock().await;
                    let job_id = ledger.get(task_id).map(|tip| tip.job_id().clone());
                    ledger.finish(task_id, TaskRunState::Killed, Some("Task killed".to_string()));
                    job_id
                };
                match job_id {
                    Some(job_id) => {
                        tracing::info!(task_id = %task_id, job_id = %job_id, "Killed task");
                        reporters.wake(&job_id).await;
                    }
                    None => tracing::debug!(task_id = %task_id, "Kill for unknown task"),
                }
            }
        }

        if executor.send(action).is_err() {
            tracing::warn!("Execution queue closed, cleanup not forwarded");
        }
    }
    tracing::info!("Task cleanup loop exited");
}

async fn join_or_abort(name: &str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(component = name, error = %e, "Component panicked"),
        Err(_) => {
            tracing::warn!(component = name, "Component did not stop in time, aborting");
            handle.abort();
        }
    }
}

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the node agent. Transitions only move forward:
/// `Init -> Running -> ShuttingDown -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentState {
    Init,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Init => write!(f, "init"),
            AgentState::Running => write!(f, "running"),
            AgentState::ShuttingDown => write!(f, "shutting_down"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared lifecycle handle. Every loop holds a clone and watches `token()`;
/// the token is cancelled exactly once, on the transition to `ShuttingDown`.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<AgentState>>,
    token: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AgentState::Init);
        Self {
            state: Arc::new(tx),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// `Init -> Running`. Returns false if the agent already left `Init`.
    pub fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == AgentState::Init {
                *state = AgentState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Move to `ShuttingDown` and cancel the shared token. Only the first
    /// caller wins; later calls return false and change nothing.
    pub fn begin_shutdown(&self, reason: &str) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state < AgentState::ShuttingDown {
                *state = AgentState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if transitioned {
            tracing::info!(reason, "Node agent shutting down");
            self.token.cancel();
        }
        transitioned
    }

    /// `ShuttingDown -> Stopped`. Terminal.
    pub fn mark_stopped(&self) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == AgentState::ShuttingDown {
                *state = AgentState::Stopped;
                true
            } else {
                false
            }
        });
        if transitioned {
            tracing::info!("Node agent stopped");
        }
        transitioned
    }

    /// Wait until the agent reaches `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut rx = self.subscribe();
        // Sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| *s == AgentState::Stopped).await;
    }
}

/// Install a handler that starts the agent's shutdown on SIGTERM or SIGINT.
pub fn install_shutdown_handler(lifecycle: Lifecycle) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        let reason = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = lifecycle.token.cancelled() => return,
        };

        lifecycle.begin_shutdown(reason);
    });
}

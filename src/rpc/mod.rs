//! Outbound RPC ports.
//!
//! The agent talks to two kinds of peers: the cluster resource manager
//! (node heartbeats) and each job's coordinator (task status heartbeats).
//! Transports are supplied by the embedder through the connector traits;
//! every call is a plain request/response.

pub mod status;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::{NodeIdentity, ResourceReport};

pub use status::{HeartbeatResponse, TaskStatusReport, TrackerStatus};

/// Client for the cluster resource manager.
///
/// `node_heartbeat` fails with [`AgentError::Transport`](crate::error::AgentError::Transport)
/// on network trouble and with
/// [`AgentError::NodeDisallowed`](crate::error::AgentError::NodeDisallowed) when the
/// manager has excluded this node.
#[async_trait]
pub trait ClusterManagerClient: Send + Sync {
    async fn node_heartbeat(&self, node: &NodeIdentity, report: &ResourceReport) -> Result<()>;

    async fn close(&self) {}
}

#[async_trait]
pub trait ClusterManagerConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn ClusterManagerClient>>;
}

/// Client for one job coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn heartbeat(
        &self,
        status: &TrackerStatus,
        last_response_id: i32,
    ) -> Result<HeartbeatResponse>;

    async fn build_version(&self) -> Result<String>;

    async fn report_failure(&self, node_name: &str, kind: Option<&str>, message: &str)
        -> Result<()>;

    async fn close(&self) {}
}

#[async_trait]
pub trait CoordinatorConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn CoordinatorClient>>;
}

/// Report a failure to a coordinator that may already be gone. Never fails;
/// a delivery error is only logged.
pub async fn report_failure_best_effort(
    client: &dyn CoordinatorClient,
    node_name: &str,
    kind: Option<&str>,
    message: &str,
) {
    if let Err(e) = client.report_failure(node_name, kind, message).await {
        tracing::info!(error = %e, "Problem reporting failure to coordinator");
    }
}

//! Node-level heartbeat to the cluster resource manager.

mod heartbeat;

pub use heartbeat::ClusterHeartbeat;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node disallowed by cluster manager: {0}")]
    NodeDisallowed(String),

    #[error("Incompatible build version, coordinator: {coordinator}, node: {local}")]
    VersionMismatch { coordinator: String, local: String },

    #[error("Coordinator unreachable at {0}")]
    CoordinatorUnreachable(String),

    #[error("Disk error: {0}")]
    DiskError(String),

    #[error("Invalid session handle: {0}")]
    InvalidSession(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Only an explicit exclusion by the cluster manager escalates to a
    /// process-wide shutdown. Everything else is contained by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::NodeDisallowed(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

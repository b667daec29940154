pub mod cluster;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod reporter;
pub mod resource;
pub mod rpc;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tasks;

pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use node::{AgentDeps, NodeAgent};

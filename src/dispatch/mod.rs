//! Inbound actions and queries from the cluster manager and coordinators.

mod action;
mod dispatcher;

pub use action::{Action, SessionAction};
pub use dispatcher::{AgentStatus, Dispatcher};

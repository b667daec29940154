pub mod ledger;
pub mod queue;
pub mod task;

pub use ledger::TaskLedger;
pub use queue::{task_queues, CleanupAction, CoordinatorLaunch, LaunchRequest, QueueReceivers, TaskQueues};
pub use task::{JobId, TaskId, TaskInProgress, TaskRunState, WorkDescriptor};

//! Execution of task graphs, one-off and incremental.

mod executor;
mod report;
mod scheduler;

pub use executor::{Executor, Runtime, TaskContext};
pub use report::{BuildReport, SkipReason, TaskExecution, TaskOutcome, TaskRecord};
pub use scheduler::{IncrementalScheduler, SchedulerState};

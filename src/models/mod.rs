//! # Data Model
//!
//! Flow topology, executions and the rows shared across executor processes.

pub mod concurrency_limit;
pub mod execution;
pub mod execution_delay;
pub mod execution_queued;
pub mod execution_running;
pub mod flow;
pub mod state;

// Re-export core models for easy access
pub use concurrency_limit::ConcurrencyLimit;
pub use execution::{Execution, ExecutionTrigger, TaskRun, TaskRunAttempt};
pub use execution_delay::{DelayType, ExecutionDelay};
pub use execution_queued::ExecutionQueued;
pub use execution_running::{ConcurrencyState, ExecutionRunning};
pub use flow::{
    Concurrency, ConcurrencyBehavior, Condition, DagTask, Flow, FlowIdentity, RetryPolicy, Task,
    TaskKind, MAX_DELAY_MS,
};
pub use state::{State, StateHistory, StateTransition};

//! # Orchestration
//!
//! The executor coordinator and its boundaries.
//!
//! - **Executor**: admission, driving executions forward, kills and resumes
//! - **DelayPoller**: periodic delivery of due delays to the executor
//! - **ExecutorQueue**: outbound messages for workers and listeners
//! - **FlowRepository / ExecutionRepository**: persistence owned elsewhere
//!
//! Control flow: queue event → [`Executor`] → skip check → concurrency
//! admission → state machine → emitted task runs or terminal state. Delays
//! flow the other way, from the delay store through the [`DelayPoller`].

pub mod delay_poller;
pub mod executor;
pub mod messages;
pub mod queue;
pub mod repository;

pub use delay_poller::DelayPoller;
pub use executor::Executor;
pub use messages::{ExecutorMessage, WorkerTaskResult};
pub use queue::{ChannelExecutorQueue, ExecutorQueue};
pub use repository::{
    ExecutionRepository, FlowRepository, InMemoryExecutionRepository, InMemoryFlowRepository,
};

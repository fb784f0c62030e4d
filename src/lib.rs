#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Flowline Core
//!
//! Execution coordination layer of a workflow orchestration engine.
//!
//! ## Overview
//!
//! Flows are trees of tasks: sequential, parallel, DAG, conditional and
//! for-each blocks, each with optional `errors` and `finally` branches. The
//! executor decides which task runs become eligible next, folds their
//! outcomes into block and execution states, caps the number of running
//! executions per flow across every executor process, and resumes paused or
//! retrying task runs when their delay is due.
//!
//! ## Module Organization
//!
//! - [`models`] - Flow topology, executions, task runs, states and store rows
//! - [`state_machine`] - Task run transitions and flowable resolution
//! - [`database`] - Concurrency limit and delay stores (PostgreSQL and in-memory)
//! - [`services`] - Operator skip lists
//! - [`orchestration`] - Executor coordinator, queue boundary and delay poller
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowline_core::database::{InMemoryConcurrencyLimitStorage, InMemoryExecutionDelayStorage};
//! use flowline_core::models::{Execution, Flow, Task};
//! use flowline_core::orchestration::{
//!     ChannelExecutorQueue, Executor, InMemoryExecutionRepository, InMemoryFlowRepository,
//! };
//! use flowline_core::services::SkipExecutionService;
//! use std::sync::Arc;
//!
//! # async fn example() -> flowline_core::FlowlineResult<()> {
//! let flow = Flow::new("company.team", "hello", vec![Task::runnable("say-hello")]);
//! let flows = Arc::new(InMemoryFlowRepository::new());
//! flows.create(flow.clone());
//!
//! let (queue, mut messages) = ChannelExecutorQueue::new(1024);
//! let executor = Executor::new(
//!     Arc::new(InMemoryConcurrencyLimitStorage::new()),
//!     Arc::new(InMemoryExecutionDelayStorage::new()),
//!     flows,
//!     Arc::new(InMemoryExecutionRepository::new()),
//!     Arc::new(queue),
//!     Arc::new(SkipExecutionService::new()),
//! );
//!
//! executor.submit(Execution::new_for(&flow)).await?;
//! while let Ok(message) = messages.try_recv() {
//!     println!("{}", message.message_type());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;

pub use config::{DatabaseConfig, ExecutorSettings, FlowlineConfig, SkipConfig};
pub use error::{FlowlineError, FlowlineResult};
pub use models::{Execution, Flow, State, Task, TaskRun};
pub use orchestration::{Executor, ExecutorMessage, WorkerTaskResult};

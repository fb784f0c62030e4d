//! # Database Operations
//!
//! Shared stores of the execution coordination layer.
//!
//! - [`concurrency_limit_storage`] - per-flow running counters and the queue
//!   of executions waiting for a slot
//! - [`execution_delay_storage`] - wake-up markers delivered by skip-locked polling
//! - [`memory`] - in-process implementations with the same semantics
//! - [`connection`] / [`migrator`] - pool construction and embedded schema

pub mod concurrency_limit_storage;
pub mod connection;
pub mod execution_delay_storage;
pub mod memory;
pub mod migrator;

pub use concurrency_limit_storage::{
    increment, ConcurrencyLimitStorage, LimitTransaction, PgConcurrencyLimitStorage,
};
pub use connection::DatabaseConnection;
pub use execution_delay_storage::{ExecutionDelayStorage, PgExecutionDelayStorage};
pub use memory::{InMemoryConcurrencyLimitStorage, InMemoryExecutionDelayStorage};
pub use migrator::{run_migrations, MIGRATOR};

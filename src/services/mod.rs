//! Process-wide services consulted by the executor.

pub mod skip_execution_service;

pub use skip_execution_service::SkipExecutionService;

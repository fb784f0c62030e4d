//! Error types for the Flowline executor.

use crate::state_machine::errors::StateMachineError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowlineError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Messaging error: {0}")]
    MessagingError(String),
    #[error("Flow {namespace}.{flow_id} (tenant {tenant:?}) not found")]
    FlowNotFound {
        tenant: Option<String>,
        namespace: String,
        flow_id: String,
    },
    #[error("Execution {0} not found")]
    ExecutionNotFound(String),
    /// An invariant of the shared stores was observed broken; requires an operator.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
}

impl From<sqlx::Error> for FlowlineError {
    fn from(err: sqlx::Error) -> Self {
        FlowlineError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for FlowlineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        FlowlineError::DatabaseError(format!("Migration failed: {err}"))
    }
}

impl From<serde_json::Error> for FlowlineError {
    fn from(error: serde_json::Error) -> Self {
        FlowlineError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for FlowlineError {
    fn from(error: config::ConfigError) -> Self {
        FlowlineError::ConfigurationError(error.to_string())
    }
}

impl From<StateMachineError> for FlowlineError {
    fn from(error: StateMachineError) -> Self {
        FlowlineError::StateTransitionError(error.to_string())
    }
}

pub type FlowlineResult<T> = std::result::Result<T, FlowlineError>;

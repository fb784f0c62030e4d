use crate::models::State;
use thiserror::Error;
use uuid::Uuid;

/// Error types for task run and execution state machine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on event {event}")]
    InvalidTransition { from: State, event: String },

    #[error("Task '{task_id}' not found in flow")]
    TaskNotFound { task_id: String },

    #[error("Task run {task_run_id} not found in execution")]
    TaskRunNotFound { task_run_id: Uuid },

    #[error("Delay of {delay_ms}ms is out of range")]
    DelayOutOfRange { delay_ms: u64 },

    #[error("Condition evaluation failed: {reason}")]
    ConditionEvaluation { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

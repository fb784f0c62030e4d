use super::execution::Execution;
use super::state::State;
use serde::{Deserialize, Serialize};

/// Outcome of the admission of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyState {
    Running,
    Queued,
    Cancelled,
    Failed,
}

impl ConcurrencyState {
    /// State the admitted execution moves to.
    pub fn execution_state(&self) -> State {
        match self {
            Self::Running => State::Running,
            Self::Queued => State::Queued,
            Self::Cancelled => State::Cancelled,
            Self::Failed => State::Failed,
        }
    }

    /// Only a running execution holds a slot of the counter.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRunning {
    pub execution: Execution,
    pub concurrency_state: ConcurrencyState,
}

impl ExecutionRunning {
    pub fn new(execution: Execution, concurrency_state: ConcurrencyState) -> Self {
        Self {
            execution,
            concurrency_state,
        }
    }
}

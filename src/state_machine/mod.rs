// State machine module for execution coordination
//
// A task run moves through a fixed transition table; flowable blocks are
// resolved by one closed `match` over the task kinds and the execution state
// machine applies the resulting actions until it reaches a fixpoint.

pub mod errors;
pub mod execution_state_machine;
pub mod flowable;
pub mod task_run_state_machine;
pub mod truthiness;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use execution_state_machine::{AttemptOutcome, ExecutionStateMachine, Transition, WaitRequest};
pub use flowable::{Resolution, EVALUATION_ERROR, EVALUATION_RESULT};
pub use task_run_state_machine::{TaskRunEvent, TaskRunStateMachine};
pub use truthiness::is_truthy;

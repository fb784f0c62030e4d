use super::errors::{StateMachineError, StateMachineResult};
use crate::logging::log_task_run_operation;
use crate::models::{State, TaskRun};
use serde::{Deserialize, Serialize};

/// Events that can trigger task run state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskRunEvent {
    /// Dispatch a runnable or open a flowable block
    Start,
    /// Suspend a pause task until it is resumed
    Pause,
    /// Resume a paused task
    Resume,
    /// End a running task run in the given terminal state
    Complete(State),
    /// A failed attempt with attempts left
    Retry,
    /// The retry backoff elapsed
    Restart,
    /// Re-enter the created state after a restart, attempt history preserved
    Recreate,
    /// Operator kill or kill cascade
    Kill,
}

impl TaskRunEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete(_) => "complete",
            Self::Retry => "retry",
            Self::Restart => "restart",
            Self::Recreate => "recreate",
            Self::Kill => "kill",
        }
    }
}

/// Transition table of a single task run.
///
/// A terminal task run never transitions again; every event applied to one
/// is an [`StateMachineError::InvalidTransition`].
pub struct TaskRunStateMachine;

impl TaskRunStateMachine {
    /// Determine the target state based on current state and event
    pub fn determine_target_state(current: State, event: TaskRunEvent) -> StateMachineResult<State> {
        let target = match (current, event) {
            (State::Created, TaskRunEvent::Start) => State::Running,

            (State::Created | State::Running, TaskRunEvent::Pause) => State::Paused,
            (State::Paused, TaskRunEvent::Resume) => State::Running,

            (State::Running, TaskRunEvent::Complete(target)) if target.is_terminal() => target,
            (State::Created, TaskRunEvent::Complete(State::Failed)) => State::Failed,

            (State::Running, TaskRunEvent::Retry) => State::Retrying,
            (State::Retrying, TaskRunEvent::Restart) => State::Restarted,
            (State::Restarted, TaskRunEvent::Recreate) => State::Created,

            (from, TaskRunEvent::Kill) if !from.is_terminal() => State::Killed,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: format!("{event:?}"),
                })
            }
        };

        Ok(target)
    }

    /// Apply an event to a task run, recording the new state in its history
    pub fn transition(task_run: &mut TaskRun, event: TaskRunEvent) -> StateMachineResult<State> {
        let target = Self::determine_target_state(task_run.current_state(), event)?;
        task_run.state.push(target);

        log_task_run_operation(
            event.event_type(),
            &task_run.execution_id,
            &task_run.id.to_string(),
            &task_run.task_id,
            &target.to_string(),
            None,
        );

        Ok(target)
    }
}

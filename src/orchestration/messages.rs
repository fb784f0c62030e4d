//! Messages crossing the queue boundary of the executor.

use crate::models::{Execution, State, Task, TaskRun};
use crate::state_machine::AttemptOutcome;
use serde_json::{Map, Value};

/// Emitted by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorMessage {
    /// A runnable task run a worker must execute
    WorkerJob { task: Task, task_run: TaskRun },
    /// A task run that was running on a worker got killed
    KillTaskRun { task_run: TaskRun },
    ExecutionUpdated { execution: Execution },
    ExecutionTerminated { execution: Execution },
}

impl ExecutorMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::WorkerJob { .. } => "worker_job",
            Self::KillTaskRun { .. } => "kill_task_run",
            Self::ExecutionUpdated { .. } => "execution_updated",
            Self::ExecutionTerminated { .. } => "execution_terminated",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::WorkerJob { task_run, .. } | Self::KillTaskRun { task_run } => &task_run.execution_id,
            Self::ExecutionUpdated { execution } | Self::ExecutionTerminated { execution } => {
                &execution.id
            }
        }
    }
}

/// Outcome of one attempt, reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
    pub outcome: AttemptOutcome,
}

impl WorkerTaskResult {
    pub fn new(task_run: TaskRun, state: State) -> Self {
        Self {
            task_run,
            outcome: AttemptOutcome {
                state,
                outputs: Map::new(),
                error: None,
            },
        }
    }

    pub fn success(task_run: TaskRun) -> Self {
        Self::new(task_run, State::Success)
    }

    pub fn failed(task_run: TaskRun, error: impl Into<String>) -> Self {
        let mut result = Self::new(task_run, State::Failed);
        result.outcome.error = Some(error.into());
        result
    }

    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcome.outputs.insert(name.into(), value);
        self
    }
}

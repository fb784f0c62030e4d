use super::errors::{StateMachineError, StateMachineResult};
use super::flowable::{Action, Resolution, Resolver, EVALUATION_ERROR, EVALUATION_RESULT};
use super::task_run_state_machine::{TaskRunEvent, TaskRunStateMachine};
use crate::logging::log_execution_operation;
use crate::models::{
    DelayType, Execution, Flow, State, StateHistory, Task, TaskKind, TaskRun, TaskRunAttempt,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// A task run that must be woken up at `date`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRequest {
    pub task_run_id: Uuid,
    pub delay_type: DelayType,
    pub date: DateTime<Utc>,
}

/// Effects of driving an execution forward.
#[derive(Debug, Default)]
pub struct Transition {
    /// Runnable task runs to hand to workers
    pub dispatch: Vec<TaskRun>,
    pub waits: Vec<WaitRequest>,
    /// Set when the execution reached its terminal state in this transition
    pub terminal: Option<State>,
    pub changed: bool,
}

/// What a worker reported for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub state: State,
    pub outputs: Map<String, Value>,
    pub error: Option<String>,
}

/// Drives one execution of one flow revision.
pub struct ExecutionStateMachine<'f> {
    flow: &'f Flow,
}

impl<'f> ExecutionStateMachine<'f> {
    pub fn new(flow: &'f Flow) -> Self {
        Self { flow }
    }

    /// Validated execution-level transition.
    pub fn transition_execution(execution: &mut Execution, target: State) -> StateMachineResult<()> {
        let from = execution.current_state();
        let allowed = match (from, target) {
            (
                State::Created,
                State::Running | State::Queued | State::Cancelled | State::Failed | State::Killed,
            ) => true,
            (State::Queued, State::Running | State::Killed | State::Cancelled) => true,
            (State::Running, State::Killing) => true,
            (State::Running, target) => target.is_terminal(),
            (State::Killing, State::Killed) => true,
            (from, State::Restarted) => from.is_failure(),
            (
                State::Restarted,
                State::Running | State::Queued | State::Cancelled | State::Failed,
            ) => true,
            _ => false,
        };

        if !allowed {
            return Err(StateMachineError::InvalidTransition {
                from,
                event: format!("execution -> {target}"),
            });
        }

        execution.state.push(target);
        log_execution_operation(
            "transition",
            &execution.id,
            &execution.namespace,
            &execution.flow_id,
            &target.to_string(),
            None,
        );
        Ok(())
    }

    /// Move an admitted execution to `RUNNING`.
    pub fn start(&self, execution: &mut Execution) -> StateMachineResult<()> {
        Self::transition_execution(execution, State::Running)
    }

    /// Apply resolution passes until nothing changes.
    pub fn advance(&self, execution: &mut Execution) -> StateMachineResult<Transition> {
        let mut transition = Transition::default();
        if !matches!(execution.current_state(), State::Running | State::Killing) {
            return Ok(transition);
        }

        loop {
            let (resolution, actions) = Resolver::new(self.flow, execution).resolve();

            if actions.is_empty() {
                if let Resolution::Done(state) = resolution {
                    let terminal = if execution.current_state() == State::Killing {
                        State::Killed
                    } else {
                        state
                    };
                    Self::transition_execution(execution, terminal)?;
                    transition.terminal = Some(terminal);
                    transition.changed = true;
                }
                return Ok(transition);
            }

            transition.changed = true;
            for action in actions {
                self.apply(execution, action, &mut transition)?;
            }
        }
    }

    fn apply(
        &self,
        execution: &mut Execution,
        action: Action<'f>,
        transition: &mut Transition,
    ) -> StateMachineResult<()> {
        match action {
            Action::Create { task, scope } => {
                let mut task_run =
                    TaskRun::new(execution, &task.id, scope.parent, scope.iteration, scope.value);
                open(task, &mut task_run, transition)?;
                execution.task_run_list.push(task_run);
            }
            Action::Start { task, task_run_id } => {
                let task_run = find_task_run_mut(execution, task_run_id)?;
                open(task, task_run, transition)?;
            }
            Action::Terminate { task_run_id, state } => {
                let task_run = find_task_run_mut(execution, task_run_id)?;
                TaskRunStateMachine::transition(task_run, TaskRunEvent::Complete(state))?;
            }
            Action::RecordCondition {
                task_run_id,
                result,
            } => {
                let task_run = find_task_run_mut(execution, task_run_id)?;
                match result {
                    Ok(result) => {
                        task_run
                            .outputs
                            .insert(EVALUATION_RESULT.to_string(), Value::Bool(result));
                    }
                    Err(reason) => {
                        warn!(
                            execution_id = %task_run.execution_id,
                            task_id = %task_run.task_id,
                            reason = %reason,
                            "If condition could not be evaluated"
                        );
                        task_run
                            .outputs
                            .insert(EVALUATION_ERROR.to_string(), Value::String(reason));
                    }
                }
            }
        }
        Ok(())
    }

    /// Record a worker-reported attempt outcome.
    ///
    /// Results for task runs that are already terminal (late or duplicate
    /// deliveries, kills) are ignored. A failed attempt with attempts left
    /// moves the task run to `RETRYING` and returns when to restart it.
    pub fn apply_worker_result(
        &self,
        execution: &mut Execution,
        task_run_id: Uuid,
        outcome: AttemptOutcome,
    ) -> StateMachineResult<Option<WaitRequest>> {
        let killing = execution.current_state() == State::Killing;
        let task_run = find_task_run_mut(execution, task_run_id)?;

        if task_run.state.is_terminated() {
            debug!(
                task_run_id = %task_run_id,
                state = %task_run.current_state(),
                "Ignoring worker result for terminated task run"
            );
            return Ok(None);
        }

        let retry = self
            .flow
            .find_task(&task_run.task_id)
            .ok_or_else(|| StateMachineError::TaskNotFound {
                task_id: task_run.task_id.clone(),
            })?
            .retry
            .clone();

        if let Some(attempt) = task_run.last_attempt_mut() {
            attempt.state.push(outcome.state);
            attempt.error = outcome.error;
        }
        task_run.outputs.extend(outcome.outputs);

        if outcome.state == State::Failed && !killing {
            let attempts = task_run.attempts.len() as u32;
            if let Some(retry) = retry.filter(|r| attempts < r.max_attempts) {
                let date = wake_up_at(retry.interval_ms)?;
                TaskRunStateMachine::transition(task_run, TaskRunEvent::Retry)?;
                return Ok(Some(WaitRequest {
                    task_run_id,
                    delay_type: DelayType::RestartFailedTask,
                    date,
                }));
            }
        }

        TaskRunStateMachine::transition(task_run, TaskRunEvent::Complete(outcome.state))?;
        Ok(None)
    }

    /// Start killing the execution.
    ///
    /// Every non-terminal leaf task run becomes `KILLED`; the returned ones
    /// were running on a worker. Flowable task runs are closed by the next
    /// [`advance`](Self::advance), after their `finally` blocks ran.
    pub fn kill(&self, execution: &mut Execution) -> StateMachineResult<Vec<TaskRun>> {
        match execution.current_state() {
            State::Created | State::Queued => {
                Self::transition_execution(execution, State::Killed)?;
                Self::discard_created(execution)?;
                return Ok(Vec::new());
            }
            State::Running => Self::transition_execution(execution, State::Killing)?,
            _ => return Ok(Vec::new()),
        }

        let flowables: HashSet<&str> = self
            .flow
            .all_tasks()
            .into_iter()
            .filter(|task| task.is_flowable())
            .map(|task| task.id.as_str())
            .collect();
        let runnables: HashSet<&str> = self
            .flow
            .all_tasks()
            .into_iter()
            .filter(|task| matches!(task.kind, TaskKind::Runnable { .. }))
            .map(|task| task.id.as_str())
            .collect();

        let mut killed = Vec::new();
        for task_run in execution
            .task_run_list
            .iter_mut()
            .filter(|tr| !tr.state.is_terminated() && !flowables.contains(tr.task_id.as_str()))
        {
            let was_running = task_run.current_state() == State::Running;
            TaskRunStateMachine::transition(task_run, TaskRunEvent::Kill)?;
            if let Some(attempt) = task_run.last_attempt_mut() {
                if !attempt.state.is_terminated() {
                    attempt.state.push(State::Killed);
                }
            }
            if was_running && runnables.contains(task_run.task_id.as_str()) {
                killed.push(task_run.clone());
            }
        }

        Ok(killed)
    }

    /// Resume a paused task run, which then succeeds.
    ///
    /// Returns `false` when the task run was already terminal, e.g. resumed
    /// manually before its timeout fired.
    pub fn resume_task_run(
        &self,
        execution: &mut Execution,
        task_run_id: Uuid,
    ) -> StateMachineResult<bool> {
        let task_run = find_task_run_mut(execution, task_run_id)?;
        match task_run.current_state() {
            State::Paused => {
                TaskRunStateMachine::transition(task_run, TaskRunEvent::Resume)?;
                TaskRunStateMachine::transition(task_run, TaskRunEvent::Complete(State::Success))?;
                Ok(true)
            }
            state if state.is_terminal() => Ok(false),
            from => Err(StateMachineError::InvalidTransition {
                from,
                event: format!("{:?}", TaskRunEvent::Resume),
            }),
        }
    }

    /// Re-dispatch a task run whose retry backoff elapsed.
    ///
    /// Returns `None` if the task run left `RETRYING` in the meantime.
    pub fn restart_task_run(
        &self,
        execution: &mut Execution,
        task_run_id: Uuid,
    ) -> StateMachineResult<Option<TaskRun>> {
        let task_run = find_task_run_mut(execution, task_run_id)?;
        if task_run.current_state() != State::Retrying {
            return Ok(None);
        }

        TaskRunStateMachine::transition(task_run, TaskRunEvent::Restart)?;
        TaskRunStateMachine::transition(task_run, TaskRunEvent::Recreate)?;
        TaskRunStateMachine::transition(task_run, TaskRunEvent::Start)?;
        task_run.attempts.push(TaskRunAttempt::running());

        Ok(Some(task_run.clone()))
    }

    /// Operator restart of a `FAILED`, `KILLED` or `CANCELLED` execution.
    ///
    /// Every failed task run whose ancestors all failed too is cloned into a
    /// new `CREATED` run pointing back at it through `restarted_from`. The
    /// children of a cloned flowable move under its clone, so the runs that
    /// already succeeded are kept. The execution is left `RESTARTED`, waiting
    /// for admission. Returns the number of cloned task runs.
    pub fn restart(&self, execution: &mut Execution) -> StateMachineResult<usize> {
        Self::transition_execution(execution, State::Restarted)?;

        let mut clones = Vec::new();
        for failed in execution
            .task_run_list
            .iter()
            .filter(|run| restartable(execution, run))
        {
            let mut clone = TaskRun::new(
                execution,
                failed.task_id.clone(),
                failed.parent_task_run_id,
                failed.iteration,
                failed.value.clone(),
            );
            clone.restarted_from = Some(failed.id);
            clone.state = StateHistory::starting_at(State::Restarted);
            TaskRunStateMachine::transition(&mut clone, TaskRunEvent::Recreate)?;
            clones.push(clone);
        }

        let moved: HashMap<Uuid, Uuid> = clones
            .iter()
            .filter_map(|clone| clone.restarted_from.map(|from| (from, clone.id)))
            .collect();
        let cloned = clones.len();
        execution.task_run_list.extend(clones);
        for run in &mut execution.task_run_list {
            if let Some(parent) = run.parent_task_run_id.and_then(|p| moved.get(&p)) {
                run.parent_task_run_id = Some(*parent);
            }
        }

        debug!(execution_id = %execution.id, cloned, "Cloned failed task runs");
        Ok(cloned)
    }

    /// Kill the task runs still `CREATED` in an execution refused at
    /// admission, i.e. the clones of a restart that never started.
    pub fn discard_created(execution: &mut Execution) -> StateMachineResult<usize> {
        let mut discarded = 0;
        for task_run in execution
            .task_run_list
            .iter_mut()
            .filter(|tr| tr.current_state() == State::Created)
        {
            TaskRunStateMachine::transition(task_run, TaskRunEvent::Kill)?;
            discarded += 1;
        }
        Ok(discarded)
    }
}

/// First transition of a task run, by kind of task.
fn open(task: &Task, task_run: &mut TaskRun, transition: &mut Transition) -> StateMachineResult<()> {
    match &task.kind {
        TaskKind::Runnable { .. } => {
            TaskRunStateMachine::transition(task_run, TaskRunEvent::Start)?;
            task_run.attempts.push(TaskRunAttempt::running());
            transition.dispatch.push(task_run.clone());
        }
        TaskKind::Pause { delay_ms } => {
            let date = delay_ms.map(wake_up_at).transpose()?;
            TaskRunStateMachine::transition(task_run, TaskRunEvent::Pause)?;
            if let Some(date) = date {
                transition.waits.push(WaitRequest {
                    task_run_id: task_run.id,
                    delay_type: DelayType::ResumeFlow,
                    date,
                });
            }
        }
        _ => {
            TaskRunStateMachine::transition(task_run, TaskRunEvent::Start)?;
        }
    }
    Ok(())
}

/// `now + delay_ms`, unless the date cannot be represented.
fn wake_up_at(delay_ms: u64) -> StateMachineResult<DateTime<Utc>> {
    i64::try_from(delay_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or(StateMachineError::DelayOutOfRange { delay_ms })
}

/// A failed run that is the latest of its scope, under failed ancestors only.
fn restartable(execution: &Execution, run: &TaskRun) -> bool {
    let mut current = Some(run);
    while let Some(run) = current {
        let latest = execution
            .find_child(run.parent_task_run_id, &run.task_id, run.iteration)
            .map(|tr| tr.id);
        if latest != Some(run.id) || !run.current_state().is_failure() {
            return false;
        }
        current = match run.parent_task_run_id {
            Some(parent) => match execution.find_task_run(parent) {
                Some(parent) => Some(parent),
                None => return false,
            },
            None => None,
        };
    }
    true
}

fn find_task_run_mut(
    execution: &mut Execution,
    task_run_id: Uuid,
) -> StateMachineResult<&mut TaskRun> {
    execution
        .find_task_run_mut(task_run_id)
        .ok_or(StateMachineError::TaskRunNotFound { task_run_id })
}

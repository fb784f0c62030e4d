//! # Flowable Resolution
//!
//! One pass over the flow tree that pairs every task with its task runs and
//! decides, for each flowable block, which children become eligible and
//! whether the block reached a terminal state. A pass never mutates the
//! execution: it returns [`Action`]s that the execution state machine applies
//! before running the next pass, until a pass yields nothing.
//!
//! Every block is `main` + `errors` + `finally`:
//! - `errors` run only when `main` ended `FAILED`, and never upgrade it.
//! - `finally` always runs once `main` (and `errors`) are terminal, even while
//!   the execution is being killed; its state is folded into the block's.

use super::errors::StateMachineError;
use super::truthiness::is_truthy;
use crate::models::{Condition, DagTask, Execution, Flow, State, Task, TaskKind, TaskRun};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Output key recording the evaluated branch of an `If` task run.
pub const EVALUATION_RESULT: &str = "evaluationResult";
/// Output key recording why an `If` condition could not be evaluated.
pub const EVALUATION_ERROR: &str = "evaluationError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Some child is still running or was just made eligible
    Pending,
    Done(State),
}

/// Where new child task runs are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub parent: Option<Uuid>,
    pub iteration: Option<usize>,
    pub value: Option<String>,
}

impl Scope {
    pub fn root() -> Self {
        Self {
            parent: None,
            iteration: None,
            value: None,
        }
    }

    /// Children inherit the iteration of their parent.
    fn child_of(run: &TaskRun) -> Self {
        Self {
            parent: Some(run.id),
            iteration: run.iteration,
            value: run.value.clone(),
        }
    }

    fn iteration_of(run: &TaskRun, index: usize, value: &Value) -> Self {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            parent: Some(run.id),
            iteration: Some(index),
            value: Some(rendered),
        }
    }
}

#[derive(Debug)]
pub enum Action<'f> {
    Create { task: &'f Task, scope: Scope },
    /// Open a restarted clone still in `CREATED`
    Start { task: &'f Task, task_run_id: Uuid },
    Terminate { task_run_id: Uuid, state: State },
    RecordCondition {
        task_run_id: Uuid,
        result: Result<bool, String>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Ctx {
    /// No new children outside of `finally` blocks
    killing: bool,
}

/// A `FAILED` child with `allow_failure` counts as `WARNING` for its parent.
fn effective_state(task: &Task, state: State) -> State {
    if task.allow_failure && state == State::Failed {
        State::Warning
    } else {
        state
    }
}

fn closing(states: impl IntoIterator<Item = State>, skipped_by_kill: bool) -> Resolution {
    let state = State::fold(states);
    if skipped_by_kill {
        Resolution::Done(state.worst(State::Killed))
    } else {
        Resolution::Done(state)
    }
}

pub struct Resolver<'e, 'f> {
    flow: &'f Flow,
    execution: &'e Execution,
    actions: Vec<Action<'f>>,
}

impl<'e, 'f> Resolver<'e, 'f> {
    pub fn new(flow: &'f Flow, execution: &'e Execution) -> Self {
        Self {
            flow,
            execution,
            actions: Vec::new(),
        }
    }

    /// Resolves the flow as the root block of the execution.
    pub fn resolve(mut self) -> (Resolution, Vec<Action<'f>>) {
        let flow = self.flow;
        let ctx = Ctx {
            killing: self.execution.current_state() == State::Killing,
        };
        let scope = Scope::root();

        let main = self.sequence(&flow.tasks, &scope, ctx);
        let resolution = self.block_tail(main, &flow.errors, &flow.finally, &scope, ctx);

        (resolution, self.actions)
    }

    fn task_run(&mut self, task: &'f Task, run: &'e TaskRun, ctx: Ctx) -> Resolution {
        if run.state.is_terminated() {
            return Resolution::Done(run.current_state());
        }
        if run.current_state() == State::Created {
            self.actions.push(Action::Start {
                task,
                task_run_id: run.id,
            });
            return Resolution::Pending;
        }
        if !task.is_flowable() || run.current_state() != State::Running {
            return Resolution::Pending;
        }

        let scope = Scope::child_of(run);
        let main = match &task.kind {
            TaskKind::Runnable { .. } | TaskKind::Pause { .. } => return Resolution::Pending,
            TaskKind::Sequential { tasks } => self.sequence(tasks, &scope, ctx),
            TaskKind::Parallel { tasks, concurrent } => {
                self.parallel(tasks, *concurrent, &scope, ctx)
            }
            TaskKind::Dag { tasks } => self.dag(tasks, &scope, ctx),
            TaskKind::If {
                condition,
                then,
                otherwise,
            } => self.condition(run, condition, then, otherwise, &scope, ctx),
            TaskKind::ForEach {
                values,
                tasks,
                concurrency_limit,
            } => self.for_each(run, values, tasks, *concurrency_limit, ctx),
        };

        match self.block_tail(main, &task.errors, &task.finally, &scope, ctx) {
            Resolution::Done(state) => {
                self.actions.push(Action::Terminate {
                    task_run_id: run.id,
                    state,
                });
                Resolution::Done(state)
            }
            Resolution::Pending => Resolution::Pending,
        }
    }

    fn block_tail(
        &mut self,
        main: Resolution,
        errors: &'f [Task],
        finally: &'f [Task],
        scope: &Scope,
        ctx: Ctx,
    ) -> Resolution {
        let Resolution::Done(state) = main else {
            return Resolution::Pending;
        };

        let execution = self.execution;
        let errors_started = errors.iter().any(|task| {
            execution
                .find_child(scope.parent, &task.id, scope.iteration)
                .is_some()
        });
        if state == State::Failed
            && (!ctx.killing || errors_started)
            && self.sequence(errors, scope, ctx) == Resolution::Pending
        {
            return Resolution::Pending;
        }

        match self.sequence(finally, scope, Ctx { killing: false }) {
            Resolution::Pending => Resolution::Pending,
            Resolution::Done(finally_state) => Resolution::Done(state.worst(finally_state)),
        }
    }

    /// One child at a time, in declaration order; a failure halts the rest.
    fn sequence(&mut self, tasks: &'f [Task], scope: &Scope, ctx: Ctx) -> Resolution {
        let execution = self.execution;
        let mut states = Vec::new();

        for task in tasks.iter().filter(|t| !t.disabled) {
            let Some(run) = execution.find_child(scope.parent, &task.id, scope.iteration) else {
                if ctx.killing {
                    return closing(states, true);
                }
                self.actions.push(Action::Create {
                    task,
                    scope: scope.clone(),
                });
                return Resolution::Pending;
            };

            match self.task_run(task, run, ctx) {
                Resolution::Pending => return Resolution::Pending,
                Resolution::Done(state) => {
                    let state = effective_state(task, state);
                    states.push(state);
                    if state.is_failure() {
                        return closing(states, false);
                    }
                }
            }
        }

        closing(states, false)
    }

    /// Every child at once, bounded by `concurrent` (0 = unbounded).
    fn parallel(
        &mut self,
        tasks: &'f [Task],
        concurrent: usize,
        scope: &Scope,
        ctx: Ctx,
    ) -> Resolution {
        let execution = self.execution;
        let mut states = Vec::new();
        let mut active = 0usize;
        let mut missing = Vec::new();

        for task in tasks.iter().filter(|t| !t.disabled) {
            match execution.find_child(scope.parent, &task.id, scope.iteration) {
                None => missing.push(task),
                Some(run) => match self.task_run(task, run, ctx) {
                    Resolution::Pending => active += 1,
                    Resolution::Done(state) => states.push(effective_state(task, state)),
                },
            }
        }

        let halted = ctx.killing || states.iter().any(State::is_failure);
        if !halted && !missing.is_empty() {
            let slots = if concurrent == 0 {
                missing.len()
            } else {
                concurrent.saturating_sub(active)
            };
            for task in missing.into_iter().take(slots) {
                self.actions.push(Action::Create {
                    task,
                    scope: scope.clone(),
                });
            }
            return Resolution::Pending;
        }

        if active > 0 {
            return Resolution::Pending;
        }
        closing(states, ctx.killing && !missing.is_empty())
    }

    /// A child is eligible once every dependency ended `SUCCESS` or `WARNING`;
    /// dependents of a failed task are never created.
    fn dag(&mut self, tasks: &'f [DagTask], scope: &Scope, ctx: Ctx) -> Resolution {
        let execution = self.execution;
        let disabled: HashSet<&str> = tasks
            .iter()
            .filter(|d| d.task.disabled)
            .map(|d| d.task.id.as_str())
            .collect();
        let mut done: HashMap<&str, State> = HashMap::new();
        let mut active = 0usize;
        let mut missing: Vec<&'f DagTask> = Vec::new();

        for dag_task in tasks.iter().filter(|d| !d.task.disabled) {
            let task = &dag_task.task;
            match execution.find_child(scope.parent, &task.id, scope.iteration) {
                None => missing.push(dag_task),
                Some(run) => match self.task_run(task, run, ctx) {
                    Resolution::Pending => active += 1,
                    Resolution::Done(state) => {
                        done.insert(task.id.as_str(), effective_state(task, state));
                    }
                },
            }
        }

        let mut blocked: HashSet<&str> = HashSet::new();
        loop {
            let before = blocked.len();
            for dag_task in &missing {
                let id = dag_task.task.id.as_str();
                if blocked.contains(id) {
                    continue;
                }
                let upstream_failed = dag_task.depends_on.iter().any(|dependency| {
                    blocked.contains(dependency.as_str())
                        || done.get(dependency.as_str()).is_some_and(State::is_failure)
                });
                if upstream_failed {
                    blocked.insert(id);
                }
            }
            if blocked.len() == before {
                break;
            }
        }

        let mut waiting = 0usize;
        for dag_task in &missing {
            if blocked.contains(dag_task.task.id.as_str()) {
                continue;
            }
            waiting += 1;
            let ready = dag_task.depends_on.iter().all(|dependency| {
                disabled.contains(dependency.as_str()) || done.contains_key(dependency.as_str())
            });
            if ready && !ctx.killing {
                self.actions.push(Action::Create {
                    task: &dag_task.task,
                    scope: scope.clone(),
                });
            }
        }

        if active > 0 || (waiting > 0 && !ctx.killing) {
            return Resolution::Pending;
        }
        closing(done.into_values(), ctx.killing && waiting > 0)
    }

    /// Exactly one branch, chosen once and recorded on the task run.
    fn condition(
        &mut self,
        run: &'e TaskRun,
        condition: &'f Condition,
        then: &'f [Task],
        otherwise: &'f [Task],
        scope: &Scope,
        ctx: Ctx,
    ) -> Resolution {
        if run.outputs.contains_key(EVALUATION_ERROR) {
            return Resolution::Done(State::Failed);
        }

        let result = match run.outputs.get(EVALUATION_RESULT) {
            Some(Value::Bool(result)) => *result,
            _ => match self.evaluate(condition) {
                Ok(result) => {
                    self.actions.push(Action::RecordCondition {
                        task_run_id: run.id,
                        result: Ok(result),
                    });
                    result
                }
                Err(error) => {
                    self.actions.push(Action::RecordCondition {
                        task_run_id: run.id,
                        result: Err(error.to_string()),
                    });
                    return Resolution::Done(State::Failed);
                }
            },
        };

        let branch = if result { then } else { otherwise };
        self.sequence(branch, scope, ctx)
    }

    fn evaluate(&self, condition: &Condition) -> Result<bool, StateMachineError> {
        match condition {
            Condition::Value(value) => Ok(is_truthy(value)),
            Condition::Input(name) => self
                .execution
                .inputs
                .get(name)
                .map(is_truthy)
                .ok_or_else(|| StateMachineError::ConditionEvaluation {
                    reason: format!("input '{name}' is not defined"),
                }),
        }
    }

    /// One sequence of `tasks` per value, `limit` iterations at once (0 = unbounded).
    fn for_each(
        &mut self,
        run: &'e TaskRun,
        values: &'f [Value],
        tasks: &'f [Task],
        limit: usize,
        ctx: Ctx,
    ) -> Resolution {
        if values.is_empty() || tasks.iter().all(|t| t.disabled) {
            return Resolution::Done(State::Success);
        }

        let execution = self.execution;
        let mut states = Vec::new();
        let mut active = 0usize;
        let mut missing = Vec::new();

        for (index, value) in values.iter().enumerate() {
            let scope = Scope::iteration_of(run, index, value);
            let started = tasks.iter().any(|task| {
                execution
                    .find_child(scope.parent, &task.id, scope.iteration)
                    .is_some()
            });
            if !started {
                missing.push(scope);
                continue;
            }
            match self.sequence(tasks, &scope, ctx) {
                Resolution::Pending => active += 1,
                Resolution::Done(state) => states.push(state),
            }
        }

        let halted = ctx.killing || states.iter().any(State::is_failure);
        if !halted && !missing.is_empty() {
            let slots = if limit == 0 {
                missing.len()
            } else {
                limit.saturating_sub(active)
            };
            for scope in missing.iter().take(slots) {
                self.sequence(tasks, scope, ctx);
            }
            return Resolution::Pending;
        }

        if active > 0 {
            return Resolution::Pending;
        }
        closing(states, ctx.killing && !missing.is_empty())
    }
}

//! # Executor
//!
//! Composes the skip service, the concurrency limiter, the delay store and
//! the execution state machine.
//!
//! Every operation on one execution runs under a per-execution async mutex:
//! load the snapshot, transition it, persist it, then emit. Operations on
//! different executions run concurrently; the only cross-process
//! coordination happens inside the stores. A mutex only lives in the lock
//! map while some operation on its execution is in flight.
//!
//! Slot accounting: an execution of a flow declaring `concurrency` holds a
//! slot from the moment it becomes `RUNNING` until its terminal state,
//! `finally` blocks included. Releasing the slot pops the oldest queued
//! execution of the same flow, which is started right away. A restarted
//! execution goes through admission again.

use super::messages::{ExecutorMessage, WorkerTaskResult};
use super::queue::ExecutorQueue;
use super::repository::{ExecutionRepository, FlowRepository};
use crate::database::{ConcurrencyLimitStorage, ExecutionDelayStorage, LimitTransaction};
use crate::error::{FlowlineError, FlowlineResult};
use crate::logging::log_execution_operation;
use crate::models::{
    Concurrency, ConcurrencyBehavior, ConcurrencyLimit, ConcurrencyState, DelayType, Execution,
    ExecutionDelay, ExecutionQueued, ExecutionRunning, Flow, State, TaskRun,
};
use crate::services::SkipExecutionService;
use crate::state_machine::{ExecutionStateMachine, WaitRequest};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct Executor<L, D> {
    limits: Arc<L>,
    delays: Arc<D>,
    flows: Arc<dyn FlowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn ExecutorQueue>,
    skip: Arc<SkipExecutionService>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<L, D> Executor<L, D>
where
    L: ConcurrencyLimitStorage,
    D: ExecutionDelayStorage,
{
    pub fn new(
        limits: Arc<L>,
        delays: Arc<D>,
        flows: Arc<dyn FlowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn ExecutorQueue>,
        skip: Arc<SkipExecutionService>,
    ) -> Self {
        Self {
            limits,
            delays,
            flows,
            executions,
            queue,
            skip,
            locks: DashMap::new(),
        }
    }

    pub fn skip_service(&self) -> &SkipExecutionService {
        &self.skip
    }

    /// Executions with an operation in flight.
    pub fn locked_executions(&self) -> usize {
        self.locks.len()
    }

    /// Admit a new execution and run its first transition.
    ///
    /// Returns the snapshot after admission: `RUNNING` (or already terminal),
    /// `QUEUED`, `CANCELLED` or `FAILED` depending on the flow's concurrency.
    /// A skipped or already known execution is returned untouched.
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, namespace = %execution.namespace, flow_id = %execution.flow_id))]
    pub async fn submit(&self, execution: Execution) -> FlowlineResult<Execution> {
        if self.skip.skip_execution(&execution) {
            info!("Skipping execution on operator request");
            return Ok(execution);
        }

        let id = execution.id.clone();
        self.locked(&id, self.submit_locked(execution)).await
    }

    async fn submit_locked(&self, execution: Execution) -> FlowlineResult<Execution> {
        if let Some(known) = self.executions.find_by_id(&execution.id).await? {
            debug!(state = %known.current_state(), "Execution already submitted");
            return Ok(known);
        }

        let flow = self.load_flow(&execution).await?;
        self.admit_and_start(&flow, execution, None).await
    }

    /// Operator restart of a `FAILED`, `KILLED` or `CANCELLED` execution.
    ///
    /// Failed task runs are cloned into new `CREATED` runs, then the execution
    /// is admitted again and may queue behind its flow's limit. Clones of an
    /// execution refused at admission end `KILLED`.
    #[instrument(skip(self))]
    pub async fn restart(&self, execution_id: &str) -> FlowlineResult<Execution> {
        self.locked(execution_id, self.restart_locked(execution_id))
            .await
    }

    async fn restart_locked(&self, execution_id: &str) -> FlowlineResult<Execution> {
        let mut execution = self.load_execution(execution_id).await?;
        if self.skip.skip_execution(&execution) {
            info!("Skipping restart on operator request");
            return Ok(execution);
        }

        let flow = self.load_flow(&execution).await?;
        let cloned = ExecutionStateMachine::new(&flow).restart(&mut execution)?;
        info!(cloned, "Restarting execution");
        self.executions.save(&execution).await?;
        self.emit_updated(&execution).await?;

        self.admit_and_start(&flow, execution, Some(State::Restarted))
            .await
    }

    /// Admission, then the first transition.
    ///
    /// `stored` is the state of the persisted snapshot. A `QUEUED` snapshot
    /// only replaces that one: once the queue row is committed another
    /// process may pop the execution and save it first.
    async fn admit_and_start(
        &self,
        flow: &Flow,
        mut execution: Execution,
        stored: Option<State>,
    ) -> FlowlineResult<Execution> {
        if let Some(reason) = rejection(flow) {
            warn!(reason = %reason, "Rejecting execution of an unusable flow");
            let target = if flow.disabled {
                State::Cancelled
            } else {
                State::Failed
            };
            ExecutionStateMachine::transition_execution(&mut execution, target)?;
            ExecutionStateMachine::discard_created(&mut execution)?;
            self.terminate(flow, &mut execution).await?;
            return Ok(execution);
        }

        if let Some(concurrency) = &flow.concurrency {
            let running = self
                .limits
                .count_then_process(&flow.identity(), |tx, current| {
                    admit(tx, current, concurrency, execution)
                })
                .await?;
            log_execution_operation(
                "admission",
                &running.execution.id,
                &running.execution.namespace,
                &running.execution.flow_id,
                &running.execution.current_state().to_string(),
                Some(&format!("limit={}", concurrency.limit)),
            );
            execution = running.execution;
        } else {
            ExecutionStateMachine::transition_execution(&mut execution, State::Running)?;
        }

        match execution.current_state() {
            State::Running => self.drive(flow, &mut execution).await?,
            State::Queued => {
                if !self.executions.save_if(&execution, stored).await? {
                    debug!("Queued execution already taken over");
                    return self.load_execution(&execution.id).await;
                }
                self.emit_updated(&execution).await?;
            }
            _ => {
                ExecutionStateMachine::discard_created(&mut execution)?;
                let next = self.terminate(flow, &mut execution).await?;
                self.hand_on(next).await?;
            }
        }
        Ok(execution)
    }

    /// Apply a worker-reported attempt outcome and drive the execution.
    #[instrument(skip(self, result), fields(execution_id = %result.task_run.execution_id, task_id = %result.task_run.task_id, state = %result.outcome.state))]
    pub async fn handle_worker_result(&self, result: WorkerTaskResult) -> FlowlineResult<()> {
        if self.skip.skip_task_run(&result.task_run) {
            info!("Skipping worker result on operator request");
            return Ok(());
        }

        let id = result.task_run.execution_id.clone();
        self.locked(&id, self.worker_result_locked(result)).await
    }

    async fn worker_result_locked(&self, result: WorkerTaskResult) -> FlowlineResult<()> {
        let mut execution = self.load_execution(&result.task_run.execution_id).await?;
        if execution.is_terminated() {
            debug!("Ignoring worker result for a terminated execution");
            return Ok(());
        }

        let flow = self.load_flow(&execution).await?;
        let machine = ExecutionStateMachine::new(&flow);
        if let Some(wait) =
            machine.apply_worker_result(&mut execution, result.task_run.id, result.outcome)?
        {
            self.save_wait(&execution, wait).await?;
        }

        self.drive(&flow, &mut execution).await
    }

    /// Deliver due delays, then resume or restart their task runs.
    ///
    /// Returns the number of consumed delays. A delay whose handling fails
    /// stays in the store and is delivered again by a later poll.
    #[instrument(skip(self))]
    pub async fn process_due_delays(&self) -> FlowlineResult<usize> {
        self.delays.get(|delay| self.process_delay(delay)).await
    }

    async fn process_delay(&self, delay: ExecutionDelay) -> FlowlineResult<()> {
        let id = delay.execution_id.clone();
        self.locked(&id, self.delay_locked(delay)).await
    }

    async fn delay_locked(&self, delay: ExecutionDelay) -> FlowlineResult<()> {
        let mut execution = self.load_execution(&delay.execution_id).await?;
        if self.skip.skip_execution(&execution) {
            info!(execution_id = %execution.id, "Skipping delay on operator request");
            return Ok(());
        }
        if execution.is_terminated() {
            debug!(execution_id = %execution.id, "Ignoring delay of a terminated execution");
            return Ok(());
        }
        let Some(task_run_id) = delay.task_run_id else {
            warn!(execution_id = %execution.id, delay_type = %delay.delay_type, "Delay without task run");
            return Ok(());
        };

        let flow = self.load_flow(&execution).await?;
        let machine = ExecutionStateMachine::new(&flow);

        match delay.delay_type {
            DelayType::ResumeFlow => {
                if !machine.resume_task_run(&mut execution, task_run_id)? {
                    debug!(task_run_id = %task_run_id, "Task run already resumed");
                }
                self.drive(&flow, &mut execution).await
            }
            DelayType::RestartFailedTask => {
                let restarted = machine.restart_task_run(&mut execution, task_run_id)?;
                self.drive(&flow, &mut execution).await?;
                if let Some(task_run) = restarted {
                    self.dispatch(&flow, task_run).await?;
                }
                Ok(())
            }
        }
    }

    /// Kill an execution.
    ///
    /// Running task runs receive a kill message, pending delays are dropped
    /// and `finally` blocks still run before the execution ends `KILLED`.
    #[instrument(skip(self))]
    pub async fn kill(&self, execution_id: &str) -> FlowlineResult<Execution> {
        self.locked(execution_id, self.kill_locked(execution_id))
            .await
    }

    async fn kill_locked(&self, execution_id: &str) -> FlowlineResult<Execution> {
        let mut execution = self.load_execution(execution_id).await?;
        if execution.is_terminated() {
            debug!(state = %execution.current_state(), "Execution already terminated");
            return Ok(execution);
        }

        let flow = self.load_flow(&execution).await?;
        let was_queued = execution.current_state() == State::Queued;
        let killed = ExecutionStateMachine::new(&flow).kill(&mut execution)?;

        self.delays.delete_by_execution(&execution.id).await?;
        if was_queued {
            self.limits.remove_queued(&execution.id).await?;
        }

        if execution.is_terminated() {
            let next = self.terminate(&flow, &mut execution).await?;
            self.hand_on(next).await?;
        } else {
            self.drive(&flow, &mut execution).await?;
        }

        for task_run in killed {
            self.queue
                .emit(ExecutorMessage::KillTaskRun { task_run })
                .await?;
        }
        Ok(execution)
    }

    /// Manually resume a paused task run.
    ///
    /// Returns `false` if the task run was no longer paused.
    #[instrument(skip(self))]
    pub async fn resume(&self, execution_id: &str, task_run_id: Uuid) -> FlowlineResult<bool> {
        self.locked(execution_id, self.resume_locked(execution_id, task_run_id))
            .await
    }

    async fn resume_locked(&self, execution_id: &str, task_run_id: Uuid) -> FlowlineResult<bool> {
        let mut execution = self.load_execution(execution_id).await?;
        let flow = self.load_flow(&execution).await?;
        let resumed = ExecutionStateMachine::new(&flow).resume_task_run(&mut execution, task_run_id)?;
        if resumed {
            self.drive(&flow, &mut execution).await?;
        }
        Ok(resumed)
    }

    /// Advance `execution`, then start every execution the released slots
    /// were handed to.
    async fn drive(&self, flow: &Flow, execution: &mut Execution) -> FlowlineResult<()> {
        let next = self.advance(flow, execution).await?;
        self.hand_on(next).await
    }

    async fn hand_on(&self, mut next: Option<ExecutionQueued>) -> FlowlineResult<()> {
        while let Some(queued) = next.take() {
            next = self.start_queued(queued).await?;
        }
        Ok(())
    }

    async fn advance(
        &self,
        flow: &Flow,
        execution: &mut Execution,
    ) -> FlowlineResult<Option<ExecutionQueued>> {
        let transition = ExecutionStateMachine::new(flow).advance(execution)?;

        for wait in transition.waits {
            self.save_wait(execution, wait).await?;
        }

        if transition.terminal.is_some() {
            return self.terminate(flow, execution).await;
        }

        self.executions.save(execution).await?;
        for task_run in transition.dispatch {
            self.dispatch(flow, task_run).await?;
        }
        if transition.changed {
            self.emit_updated(execution).await?;
        }
        Ok(None)
    }

    /// Persist a terminated execution and release what it holds.
    async fn terminate(
        &self,
        flow: &Flow,
        execution: &mut Execution,
    ) -> FlowlineResult<Option<ExecutionQueued>> {
        self.executions.save(execution).await?;
        self.queue
            .emit(ExecutorMessage::ExecutionTerminated {
                execution: execution.clone(),
            })
            .await?;

        let removed = self.delays.delete_by_execution(&execution.id).await?;
        if removed > 0 {
            debug!(execution_id = %execution.id, removed, "Dropped pending delays");
        }

        if flow.concurrency.is_some()
            && execution
                .state
                .has_been_since(State::Running, State::Restarted)
        {
            return self.limits.release(&execution.flow_identity()).await;
        }
        Ok(None)
    }

    /// Start an execution popped from the queue; its slot is already taken.
    async fn start_queued(&self, queued: ExecutionQueued) -> FlowlineResult<Option<ExecutionQueued>> {
        let id = queued.execution.id.clone();
        self.locked(&id, self.start_queued_locked(queued)).await
    }

    async fn start_queued_locked(
        &self,
        queued: ExecutionQueued,
    ) -> FlowlineResult<Option<ExecutionQueued>> {
        // Nothing or only the pre-admission snapshot stored yet: the process
        // that queued it has not saved the QUEUED snapshot.
        let mut execution = match self.executions.find_by_id(&queued.execution.id).await? {
            Some(stored) if stored.current_state() != State::Restarted => stored,
            _ => queued.execution,
        };
        let identity = execution.flow_identity();

        if execution.current_state() != State::Queued || self.skip.skip_execution(&execution) {
            warn!(
                execution_id = %execution.id,
                state = %execution.current_state(),
                "Popped execution cannot start, handing the slot on"
            );
            return self.limits.release(&identity).await;
        }

        info!(execution_id = %execution.id, flow = %identity, "Starting queued execution");
        let flow = self.load_flow(&execution).await?;
        ExecutionStateMachine::new(&flow).start(&mut execution)?;
        self.advance(&flow, &mut execution).await
    }

    async fn dispatch(&self, flow: &Flow, task_run: TaskRun) -> FlowlineResult<()> {
        let task = flow
            .find_task(&task_run.task_id)
            .cloned()
            .ok_or_else(|| {
                FlowlineError::OrchestrationError(format!(
                    "task {} not found in flow {}",
                    task_run.task_id,
                    flow.identity()
                ))
            })?;
        self.queue
            .emit(ExecutorMessage::WorkerJob { task, task_run })
            .await
    }

    async fn save_wait(&self, execution: &Execution, wait: WaitRequest) -> FlowlineResult<()> {
        self.delays
            .save(ExecutionDelay::new(
                execution,
                Some(wait.task_run_id),
                wait.delay_type,
                wait.date,
            ))
            .await
    }

    async fn emit_updated(&self, execution: &Execution) -> FlowlineResult<()> {
        self.queue
            .emit(ExecutorMessage::ExecutionUpdated {
                execution: execution.clone(),
            })
            .await
    }

    async fn load_flow(&self, execution: &Execution) -> FlowlineResult<Flow> {
        let identity = execution.flow_identity();
        self.flows
            .find_by_id(&identity, Some(execution.flow_revision))
            .await?
            .ok_or(FlowlineError::FlowNotFound {
                tenant: identity.tenant_id,
                namespace: identity.namespace,
                flow_id: identity.flow_id,
            })
    }

    async fn load_execution(&self, execution_id: &str) -> FlowlineResult<Execution> {
        self.executions
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| FlowlineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Run `op` under the mutex of one execution.
    ///
    /// The entry is dropped afterwards unless another caller already holds a
    /// clone of the mutex and is waiting on it.
    async fn locked<T>(&self, execution_id: &str, op: impl Future<Output = T>) -> T {
        let lock = self
            .locks
            .entry(execution_id.to_string())
            .or_default()
            .clone();
        let output = {
            let _guard = lock.lock().await;
            op.await
        };
        // one reference in the map, one here
        self.locks
            .remove_if(execution_id, |_, entry| Arc::strong_count(entry) <= 2);
        output
    }
}

/// Why a flow cannot run at all.
fn rejection(flow: &Flow) -> Option<String> {
    if flow.disabled {
        return Some(format!("flow {} is disabled", flow.identity()));
    }
    flow.validate().err().map(|e| e.to_string())
}

/// Admission decision, run under the lock of the flow's counter.
fn admit(
    tx: &mut LimitTransaction,
    current: ConcurrencyLimit,
    concurrency: &Concurrency,
    mut execution: Execution,
) -> FlowlineResult<(ExecutionRunning, ConcurrencyLimit)> {
    let limit = i32::try_from(concurrency.limit).unwrap_or(i32::MAX);
    if current.running < limit {
        ExecutionStateMachine::transition_execution(&mut execution, State::Running)?;
        let running = current.running + 1;
        return Ok((
            ExecutionRunning::new(execution, ConcurrencyState::Running),
            current.with_running(running),
        ));
    }

    let state = match concurrency.behavior {
        ConcurrencyBehavior::Queue => ConcurrencyState::Queued,
        ConcurrencyBehavior::Cancel => ConcurrencyState::Cancelled,
        ConcurrencyBehavior::Fail => ConcurrencyState::Failed,
    };
    ExecutionStateMachine::transition_execution(&mut execution, state.execution_state())?;
    if state == ConcurrencyState::Queued {
        tx.queue(ExecutionQueued::of(execution.clone()));
    }
    Ok((ExecutionRunning::new(execution, state), current))
}

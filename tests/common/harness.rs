//! An executor wired to the in-memory stores, plus a simulated worker that
//! answers the jobs it emits.

use async_trait::async_trait;
use flowline_core::database::{InMemoryConcurrencyLimitStorage, InMemoryExecutionDelayStorage};
use flowline_core::models::{Execution, Flow, State, Task, TaskKind, TaskRun};
use flowline_core::orchestration::{
    ChannelExecutorQueue, ExecutionRepository, Executor, ExecutorMessage,
    InMemoryExecutionRepository, InMemoryFlowRepository, WorkerTaskResult,
};
use flowline_core::services::SkipExecutionService;
use flowline_core::{FlowlineError, FlowlineResult};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type MemoryExecutor = Executor<InMemoryConcurrencyLimitStorage, InMemoryExecutionDelayStorage>;

/// The in-memory execution repository, with faults the tests can script.
pub struct ScriptedExecutionRepository {
    inner: Arc<InMemoryExecutionRepository>,
    failing_reads: AtomicUsize,
    saved_elsewhere: Mutex<Option<Execution>>,
}

impl ScriptedExecutionRepository {
    pub fn new(inner: Arc<InMemoryExecutionRepository>) -> Self {
        Self {
            inner,
            failing_reads: AtomicUsize::new(0),
            saved_elsewhere: Mutex::new(None),
        }
    }

    /// The next `count` reads fail as if the database went away.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Store `execution` right before the next conditional save, as another
    /// executor process would.
    pub fn save_elsewhere_first(&self, execution: Execution) {
        *self.saved_elsewhere.lock() = Some(execution);
    }
}

#[async_trait]
impl ExecutionRepository for ScriptedExecutionRepository {
    async fn find_by_id(&self, execution_id: &str) -> FlowlineResult<Option<Execution>> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FlowlineError::DatabaseError("connection reset".to_string()));
        }
        self.inner.find_by_id(execution_id).await
    }

    async fn save(&self, execution: &Execution) -> FlowlineResult<()> {
        self.inner.save(execution).await
    }

    async fn save_if(&self, execution: &Execution, expected: Option<State>) -> FlowlineResult<bool> {
        let elsewhere = self.saved_elsewhere.lock().take();
        if let Some(other) = elsewhere {
            self.inner.save(&other).await?;
        }
        self.inner.save_if(execution, expected).await
    }
}

pub struct TestEnvironment {
    pub executor: Arc<MemoryExecutor>,
    pub limits: Arc<InMemoryConcurrencyLimitStorage>,
    pub delays: Arc<InMemoryExecutionDelayStorage>,
    pub flows: Arc<InMemoryFlowRepository>,
    pub executions: Arc<InMemoryExecutionRepository>,
    /// What the executor reads and writes through
    pub repository: Arc<ScriptedExecutionRepository>,
    pub skip: Arc<SkipExecutionService>,
    pub emitted: Vec<ExecutorMessage>,
    receiver: mpsc::Receiver<ExecutorMessage>,
    held: Vec<TaskRun>,
}

impl TestEnvironment {
    pub fn new(flows: &[Flow]) -> Self {
        let limits = Arc::new(InMemoryConcurrencyLimitStorage::new());
        let delays = Arc::new(InMemoryExecutionDelayStorage::new());
        let flow_repository = Arc::new(InMemoryFlowRepository::new());
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let repository = Arc::new(ScriptedExecutionRepository::new(executions.clone()));
        let skip = Arc::new(SkipExecutionService::new());
        let (queue, receiver) = ChannelExecutorQueue::new(10_000);

        for flow in flows {
            flow_repository.create(flow.clone());
        }

        let executor = Arc::new(Executor::new(
            limits.clone(),
            delays.clone(),
            flow_repository.clone(),
            repository.clone(),
            Arc::new(queue),
            skip.clone(),
        ));

        Self {
            executor,
            limits,
            delays,
            flows: flow_repository,
            executions,
            repository,
            skip,
            emitted: Vec::new(),
            receiver,
            held: Vec::new(),
        }
    }

    /// Submit and run until no worker answer is pending.
    pub async fn submit(&mut self, execution: Execution) -> Execution {
        let id = execution.id.clone();
        self.executor
            .submit(execution)
            .await
            .expect("submit should succeed");
        self.run().await;
        self.execution(&id).await
    }

    pub async fn execution(&self, execution_id: &str) -> Execution {
        self.executions
            .find_by_id(execution_id)
            .await
            .expect("repository read")
            .expect("execution should be persisted")
    }

    /// Answer every emitted job until the executor goes quiet.
    pub async fn run(&mut self) {
        loop {
            let mut answers = VecDeque::new();
            while let Ok(message) = self.receiver.try_recv() {
                if let ExecutorMessage::WorkerJob { task, task_run } = &message {
                    if let Some(answer) = self.work(task, task_run.clone()) {
                        answers.push_back(answer);
                    }
                }
                self.emitted.push(message);
            }

            if answers.is_empty() {
                return;
            }
            while let Some(answer) = answers.pop_front() {
                self.executor
                    .handle_worker_result(answer)
                    .await
                    .expect("worker result should apply");
            }
        }
    }

    fn work(&mut self, task: &Task, task_run: TaskRun) -> Option<WorkerTaskResult> {
        let plugin = match &task.kind {
            TaskKind::Runnable { plugin } => plugin.as_str(),
            _ => "",
        };
        let attempt = task_run.attempts.len() as u32;

        match plugin {
            "hold" => {
                self.held.push(task_run);
                None
            }
            "fail" => Some(WorkerTaskResult::failed(task_run, "task failed")),
            "warn" => Some(WorkerTaskResult::new(task_run, State::Warning)),
            flaky if flaky.starts_with("flaky:") => {
                let failures: u32 = flaky["flaky:".len()..].parse().unwrap_or(0);
                if attempt <= failures {
                    Some(WorkerTaskResult::failed(task_run, format!("attempt {attempt} failed")))
                } else {
                    Some(WorkerTaskResult::success(task_run))
                }
            }
            _ => {
                let value = json!(task_run.value);
                Some(WorkerTaskResult::success(task_run).with_output("value", value))
            }
        }
    }

    /// Task runs of `hold` tasks waiting for an answer.
    pub fn held(&self) -> &[TaskRun] {
        &self.held
    }

    /// Answer a held task run and keep running.
    pub async fn complete_held(&mut self, task_id: &str, state: State) {
        let position = self
            .held
            .iter()
            .position(|run| run.task_id == task_id)
            .unwrap_or_else(|| panic!("no held task run for {task_id}"));
        self.answer_held(position, state).await;
    }

    /// Answer the latest held task run of `task_id` in one execution.
    pub async fn complete_held_in(&mut self, execution_id: &str, task_id: &str, state: State) {
        let position = self
            .held
            .iter()
            .rposition(|run| run.execution_id == execution_id && run.task_id == task_id)
            .unwrap_or_else(|| panic!("no held task run for {task_id} in {execution_id}"));
        self.answer_held(position, state).await;
    }

    async fn answer_held(&mut self, position: usize, state: State) {
        let task_run = self.held.remove(position);
        self.executor
            .handle_worker_result(WorkerTaskResult::new(task_run, state))
            .await
            .expect("worker result should apply");
        self.run().await;
    }

    /// Deliver every due delay and keep running.
    pub async fn fire_due_delays(&mut self) -> usize {
        let delivered = self
            .executor
            .process_due_delays()
            .await
            .expect("delays should be processed");
        self.run().await;
        delivered
    }

    pub fn emitted_of_type(&self, message_type: &str) -> usize {
        self.emitted
            .iter()
            .filter(|m| m.message_type() == message_type)
            .count()
    }
}

/// State of the single task run of `task_id`.
pub fn state_of(execution: &Execution, task_id: &str) -> State {
    let runs = execution.find_task_runs_by_task_id(task_id);
    assert_eq!(runs.len(), 1, "expected exactly one task run for {task_id}");
    runs[0].current_state()
}

pub fn task_ids(execution: &Execution) -> Vec<&str> {
    execution
        .task_run_list
        .iter()
        .map(|run| run.task_id.as_str())
        .collect()
}

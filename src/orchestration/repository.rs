//! Flow and execution persistence seams.
//!
//! Both are owned by other services of the engine; the executor only reads
//! flow definitions and persists execution snapshots after each transition.

use crate::error::FlowlineResult;
use crate::models::{Execution, Flow, FlowIdentity, State};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// `revision = None` returns the latest revision.
    async fn find_by_id(
        &self,
        flow: &FlowIdentity,
        revision: Option<i32>,
    ) -> FlowlineResult<Option<Flow>>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn find_by_id(&self, execution_id: &str) -> FlowlineResult<Option<Execution>>;

    async fn save(&self, execution: &Execution) -> FlowlineResult<()>;

    /// Persist `execution` only while the stored snapshot is in `expected`
    /// state, `None` meaning nothing is stored yet. Returns whether it was
    /// written.
    async fn save_if(&self, execution: &Execution, expected: Option<State>) -> FlowlineResult<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowRepository {
    flows: DashMap<(FlowIdentity, i32), Flow>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, flow: Flow) {
        self.flows.insert((flow.identity(), flow.revision), flow);
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(
        &self,
        flow: &FlowIdentity,
        revision: Option<i32>,
    ) -> FlowlineResult<Option<Flow>> {
        let found = match revision {
            Some(revision) => self
                .flows
                .get(&(flow.clone(), revision))
                .map(|entry| entry.value().clone()),
            None => self
                .flows
                .iter()
                .filter(|entry| &entry.key().0 == flow)
                .max_by_key(|entry| entry.key().1)
                .map(|entry| entry.value().clone()),
        };
        Ok(found)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, Execution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn find_by_id(&self, execution_id: &str) -> FlowlineResult<Option<Execution>> {
        Ok(self
            .executions
            .get(execution_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save(&self, execution: &Execution) -> FlowlineResult<()> {
        self.executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn save_if(&self, execution: &Execution, expected: Option<State>) -> FlowlineResult<bool> {
        match self.executions.entry(execution.id.clone()) {
            Entry::Occupied(mut entry) => {
                if Some(entry.get().current_state()) != expected {
                    return Ok(false);
                }
                entry.insert(execution.clone());
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                entry.insert(execution.clone());
            }
        }
        Ok(true)
    }
}

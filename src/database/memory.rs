//! In-process stores for single-executor deployments and tests.
//!
//! Each store serializes its operations behind one mutex, which gives the
//! same exclusivity as the row locks of the PostgreSQL stores.

use super::concurrency_limit_storage::{check_counter, ConcurrencyLimitStorage, LimitTransaction};
use super::execution_delay_storage::ExecutionDelayStorage;
use crate::error::FlowlineResult;
use crate::models::{ConcurrencyLimit, ExecutionDelay, ExecutionQueued, FlowIdentity};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use tracing::warn;

#[derive(Debug, Default)]
struct LimitState {
    limits: HashMap<FlowIdentity, ConcurrencyLimit>,
    queued: VecDeque<ExecutionQueued>,
}

impl LimitState {
    fn take_oldest_queued(&mut self, flow: &FlowIdentity) -> Option<ExecutionQueued> {
        let position = self.queued.iter().position(|q| &q.identity() == flow)?;
        self.queued.remove(position)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConcurrencyLimitStorage {
    state: Mutex<LimitState>,
}

impl InMemoryConcurrencyLimitStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions waiting for a slot of `flow`.
    pub fn queued_count(&self, flow: &FlowIdentity) -> usize {
        self.state
            .lock()
            .queued
            .iter()
            .filter(|q| &q.identity() == flow)
            .count()
    }
}

#[async_trait]
impl ConcurrencyLimitStorage for InMemoryConcurrencyLimitStorage {
    async fn count_then_process<F, T>(&self, flow: &FlowIdentity, process: F) -> FlowlineResult<T>
    where
        F: FnOnce(&mut LimitTransaction, ConcurrencyLimit) -> FlowlineResult<(T, ConcurrencyLimit)>
            + Send,
        T: Send,
    {
        let mut state = self.state.lock();
        let current = state
            .limits
            .get(flow)
            .cloned()
            .unwrap_or_else(|| ConcurrencyLimit::empty(flow));

        let mut scope = LimitTransaction::default();
        let (result, updated) = process(&mut scope, current)?;
        check_counter(flow, &updated)?;

        state.limits.insert(flow.clone(), updated);
        state.queued.extend(scope.into_queued());
        Ok(result)
    }

    async fn decrement(&self, flow: &FlowIdentity) -> FlowlineResult<i32> {
        let mut state = self.state.lock();
        let Some(limit) = state.limits.get_mut(flow) else {
            warn!(flow = %flow, "Decrement on a flow without concurrency counter");
            return Ok(0);
        };

        if limit.running == 0 {
            warn!(flow = %flow, "Decrement on a zero concurrency counter, keeping it at zero");
        }
        limit.running = (limit.running - 1).max(0);
        Ok(limit.running)
    }

    async fn pop_queued(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>> {
        let mut state = self.state.lock();
        if !state.limits.contains_key(flow) {
            return Ok(None);
        }

        let popped = state.take_oldest_queued(flow);
        if popped.is_some() {
            if let Some(limit) = state.limits.get_mut(flow) {
                limit.running += 1;
            }
        }
        Ok(popped)
    }

    async fn release(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>> {
        let mut state = self.state.lock();
        if !state.limits.contains_key(flow) {
            warn!(flow = %flow, "Release on a flow without concurrency counter");
            return Ok(None);
        }

        let popped = state.take_oldest_queued(flow);
        if let Some(limit) = state.limits.get_mut(flow) {
            if limit.running == 0 {
                warn!(flow = %flow, "Release on a zero concurrency counter, keeping it at zero");
            }
            limit.running = (limit.running - 1).max(0) + i32::from(popped.is_some());
        }
        Ok(popped)
    }

    async fn remove_queued(&self, execution_id: &str) -> FlowlineResult<bool> {
        let mut state = self.state.lock();
        let before = state.queued.len();
        state.queued.retain(|q| q.execution.id != execution_id);
        Ok(state.queued.len() != before)
    }

    async fn find(&self, tenant_id: Option<&str>) -> FlowlineResult<Vec<ConcurrencyLimit>> {
        let state = self.state.lock();
        let mut limits: Vec<ConcurrencyLimit> = state
            .limits
            .values()
            .filter(|limit| limit.tenant_id.as_deref() == tenant_id)
            .cloned()
            .collect();
        limits.sort_by(|a, b| (&a.namespace, &a.flow_id).cmp(&(&b.namespace, &b.flow_id)));
        Ok(limits)
    }

    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
    ) -> FlowlineResult<Option<ConcurrencyLimit>> {
        let flow = FlowIdentity::new(tenant_id, namespace, flow_id);
        Ok(self.state.lock().limits.get(&flow).cloned())
    }

    async fn update(&self, limit: ConcurrencyLimit) -> FlowlineResult<ConcurrencyLimit> {
        warn!(flow = %limit.identity(), running = limit.running, "Overriding concurrency counter");
        self.state
            .lock()
            .limits
            .insert(limit.identity(), limit.clone());
        Ok(limit)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionDelayStorage {
    delays: Mutex<Vec<ExecutionDelay>>,
}

impl InMemoryExecutionDelayStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pending marker, due or not.
    pub fn pending(&self) -> Vec<ExecutionDelay> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl ExecutionDelayStorage for InMemoryExecutionDelayStorage {
    async fn save(&self, delay: ExecutionDelay) -> FlowlineResult<()> {
        self.delays.lock().push(delay);
        Ok(())
    }

    async fn get<F, Fut>(&self, mut consumer: F) -> FlowlineResult<usize>
    where
        F: FnMut(ExecutionDelay) -> Fut + Send,
        Fut: Future<Output = FlowlineResult<()>> + Send,
    {
        // Claimed markers leave the store while their consumer runs, so a
        // concurrent poll skips them.
        let now = Utc::now();
        let mut due: Vec<ExecutionDelay> = {
            let mut delays = self.delays.lock();
            let (due, pending): (Vec<_>, Vec<_>) =
                delays.drain(..).partition(|delay| delay.is_due(now));
            *delays = pending;
            due
        };

        due.sort_by_key(|delay| delay.date);
        let mut delivered = 0;
        let mut kept = Vec::new();
        for delay in due {
            match consumer(delay.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(delay_id = %delay.id, error = %e, "Execution delay not consumed, keeping it");
                    kept.push(delay);
                }
            }
        }

        if !kept.is_empty() {
            self.delays.lock().extend(kept);
        }
        Ok(delivered)
    }

    async fn delete_by_execution(&self, execution_id: &str) -> FlowlineResult<u64> {
        let mut delays = self.delays.lock();
        let before = delays.len();
        delays.retain(|delay| delay.execution_id != execution_id);
        Ok((before - delays.len()) as u64)
    }
}

//! # Delay Poller
//!
//! Background loop delivering due execution delays to the executor at a
//! fixed interval. Errors are logged and the loop keeps going; it stops when
//! the shutdown watch flips to `true` or its sender is dropped.

use super::executor::Executor;
use crate::database::{ConcurrencyLimitStorage, ExecutionDelayStorage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub struct DelayPoller<L, D> {
    executor: Arc<Executor<L, D>>,
    interval: Duration,
}

impl<L, D> DelayPoller<L, D>
where
    L: ConcurrencyLimitStorage + 'static,
    D: ExecutionDelayStorage + 'static,
{
    pub fn new(executor: Arc<Executor<L, D>>, interval: Duration) -> Self {
        Self { executor, interval }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting delay poller");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.executor.process_due_delays().await {
                        Ok(0) => {}
                        Ok(delivered) => debug!(delivered, "Processed due delays"),
                        Err(e) => error!(error = %e, "Delay poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Delay poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryConcurrencyLimitStorage, InMemoryExecutionDelayStorage};
    use crate::models::{DelayType, Execution, ExecutionDelay, Flow, Task};
    use crate::orchestration::{
        ChannelExecutorQueue, InMemoryExecutionRepository, InMemoryFlowRepository,
    };
    use crate::services::SkipExecutionService;
    use chrono::Utc;

    #[tokio::test]
    async fn test_poller_keeps_undeliverable_delays_and_stops_on_shutdown() {
        let delays = Arc::new(InMemoryExecutionDelayStorage::new());
        let (queue, _receiver) = ChannelExecutorQueue::new(16);
        let executor = Arc::new(Executor::new(
            Arc::new(InMemoryConcurrencyLimitStorage::new()),
            delays.clone(),
            Arc::new(InMemoryFlowRepository::new()),
            Arc::new(InMemoryExecutionRepository::new()),
            Arc::new(queue),
            Arc::new(SkipExecutionService::new()),
        ));

        // Unknown execution: every poll fails to apply it, so it stays pending.
        let flow = Flow::new("company.team", "sleepy", vec![Task::runnable("a")]);
        let execution = Execution::new_for(&flow);
        delays
            .save(ExecutionDelay::new(&execution, None, DelayType::ResumeFlow, Utc::now()))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle =
            DelayPoller::new(executor.clone(), Duration::from_millis(10)).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop")
            .unwrap();

        assert_eq!(delays.pending().len(), 1);
        assert_eq!(executor.locked_executions(), 0);
    }
}

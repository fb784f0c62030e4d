//! # Executor Queue
//!
//! Outbound side of the queue boundary. The transport is pluggable; the
//! provided implementation is an in-process tokio channel.

use super::messages::ExecutorMessage;
use crate::error::{FlowlineError, FlowlineResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

#[async_trait]
pub trait ExecutorQueue: Send + Sync {
    async fn emit(&self, message: ExecutorMessage) -> FlowlineResult<()>;
}

/// Bounded mpsc channel; `emit` waits for capacity.
#[derive(Debug, Clone)]
pub struct ChannelExecutorQueue {
    sender: mpsc::Sender<ExecutorMessage>,
}

impl ChannelExecutorQueue {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ExecutorMessage>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl ExecutorQueue for ChannelExecutorQueue {
    async fn emit(&self, message: ExecutorMessage) -> FlowlineResult<()> {
        debug!(
            message_type = message.message_type(),
            execution_id = %message.execution_id(),
            "Emitting executor message"
        );
        self.sender
            .send(message)
            .await
            .map_err(|e| FlowlineError::MessagingError(format!("executor queue closed: {e}")))
    }
}

use super::execution::Execution;
use super::flow::FlowIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An execution waiting for a concurrency slot of its flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionQueued {
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub date: DateTime<Utc>,
    pub execution: Execution,
}

impl ExecutionQueued {
    pub fn of(execution: Execution) -> Self {
        Self {
            tenant_id: execution.tenant_id.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            date: Utc::now(),
            execution,
        }
    }

    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity::new(self.tenant_id.as_deref(), &self.namespace, &self.flow_id)
    }
}

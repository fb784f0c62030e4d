use super::execution::Execution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Why an execution must be woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayType {
    /// A paused task run reached its timeout
    ResumeFlow,
    /// The retry backoff of a failed task run elapsed
    RestartFailedTask,
}

impl fmt::Display for DelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResumeFlow => write!(f, "RESUME_FLOW"),
            Self::RestartFailedTask => write!(f, "RESTART_FAILED_TASK"),
        }
    }
}

impl FromStr for DelayType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESUME_FLOW" => Ok(Self::ResumeFlow),
            "RESTART_FAILED_TASK" => Ok(Self::RestartFailedTask),
            _ => Err(format!("Invalid delay type: {s}")),
        }
    }
}

/// A "wake me at `date`" marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDelay {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub execution_id: String,
    pub task_run_id: Option<Uuid>,
    pub delay_type: DelayType,
    pub date: DateTime<Utc>,
}

impl ExecutionDelay {
    pub fn new(
        execution: &Execution,
        task_run_id: Option<Uuid>,
        delay_type: DelayType,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: execution.tenant_id.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            execution_id: execution.id.clone(),
            task_run_id,
            delay_type,
            date,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.date <= now
    }
}

use super::flow::FlowIdentity;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Running-execution counter of one flow.
///
/// A missing row is equivalent to a zero counter; the stores materialize it
/// lazily on the first admission of the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimit {
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub running: i32,
}

impl ConcurrencyLimit {
    pub fn empty(flow: &FlowIdentity) -> Self {
        Self {
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.flow_id.clone(),
            running: 0,
        }
    }

    pub fn with_running(self, running: i32) -> Self {
        Self { running, ..self }
    }

    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity::new(self.tenant_id.as_deref(), &self.namespace, &self.flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_limit_starts_at_zero() {
        let flow = FlowIdentity::new(Some("main"), "company.team", "limited");
        let limit = ConcurrencyLimit::empty(&flow);

        assert_eq!(limit.running, 0);
        assert_eq!(limit.identity(), flow);
        assert_eq!(limit.with_running(3).running, 3);
    }
}

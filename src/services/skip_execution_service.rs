//! # Skip Execution Service
//!
//! Operator deny-lists consulted at the admission boundary of the executor.
//! This is a troubleshooting lever: it lets an operator stop processing a
//! poison execution, flow, namespace or tenant without touching the stores.
//!
//! Lists are replaced wholesale. Flow entries use `tenant|namespace|flow` or
//! the tenant-agnostic `namespace|flow`; namespace entries use
//! `tenant|namespace`. Malformed entries are logged and dropped.

use crate::config::SkipConfig;
use crate::models::{Execution, TaskRun};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowSkip {
    /// `None` matches every tenant
    tenant: Option<String>,
    namespace: String,
    flow: String,
}

impl FlowSkip {
    fn parse(entry: &str) -> Option<Self> {
        let parts: Vec<&str> = entry.split('|').collect();
        match parts.as_slice() {
            [tenant, namespace, flow] => Some(Self {
                tenant: Some((*tenant).to_string()),
                namespace: (*namespace).to_string(),
                flow: (*flow).to_string(),
            }),
            [namespace, flow] => Some(Self {
                tenant: None,
                namespace: (*namespace).to_string(),
                flow: (*flow).to_string(),
            }),
            _ => {
                error!(entry = %entry, "Invalid flow skip entry, ignoring it");
                None
            }
        }
    }

    fn matches(&self, tenant: Option<&str>, namespace: &str, flow: &str) -> bool {
        self.namespace == namespace
            && self.flow == flow
            && self.tenant.as_deref().map_or(true, |t| Some(t) == tenant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NamespaceSkip {
    tenant: String,
    namespace: String,
}

impl NamespaceSkip {
    fn parse(entry: &str) -> Option<Self> {
        match entry.split('|').collect::<Vec<_>>().as_slice() {
            [tenant, namespace] => Some(Self {
                tenant: (*tenant).to_string(),
                namespace: (*namespace).to_string(),
            }),
            _ => {
                error!(entry = %entry, "Invalid namespace skip entry, ignoring it");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct SkipLists {
    executions: HashSet<String>,
    flows: Vec<FlowSkip>,
    namespaces: HashSet<NamespaceSkip>,
    tenants: HashSet<String>,
    indexer_records: HashSet<String>,
}

/// Process-wide filter shared by every executor task.
#[derive(Debug, Default)]
pub struct SkipExecutionService {
    lists: RwLock<SkipLists>,
}

impl SkipExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SkipConfig) -> Self {
        let service = Self::new();
        service.set_skip_executions(&config.executions);
        service.set_skip_flows(&config.flows);
        service.set_skip_namespaces(&config.namespaces);
        service.set_skip_tenants(&config.tenants);
        service.set_skip_indexer_records(&config.indexer_records);
        service
    }

    pub fn set_skip_executions(&self, executions: &[String]) {
        self.lists.write().executions = executions.iter().cloned().collect();
    }

    pub fn set_skip_flows(&self, flows: &[String]) {
        let parsed: Vec<FlowSkip> = flows.iter().filter_map(|f| FlowSkip::parse(f)).collect();
        if !parsed.is_empty() {
            info!(count = parsed.len(), "Installed flow skip list");
        }
        self.lists.write().flows = parsed;
    }

    pub fn set_skip_namespaces(&self, namespaces: &[String]) {
        self.lists.write().namespaces = namespaces
            .iter()
            .filter_map(|n| NamespaceSkip::parse(n))
            .collect();
    }

    pub fn set_skip_tenants(&self, tenants: &[String]) {
        self.lists.write().tenants = tenants.iter().cloned().collect();
    }

    pub fn set_skip_indexer_records(&self, records: &[String]) {
        self.lists.write().indexer_records = records.iter().cloned().collect();
    }

    /// Only checks the execution id; prefer [`skip_execution`](Self::skip_execution)
    /// when the execution itself is at hand.
    pub fn skip_execution_id(&self, execution_id: &str) -> bool {
        self.lists.read().executions.contains(execution_id)
    }

    pub fn skip_execution(&self, execution: &Execution) -> bool {
        self.should_skip(
            execution.tenant_id.as_deref(),
            &execution.namespace,
            &execution.flow_id,
            Some(&execution.id),
        )
    }

    pub fn skip_task_run(&self, task_run: &TaskRun) -> bool {
        self.should_skip(
            task_run.tenant_id.as_deref(),
            &task_run.namespace,
            &task_run.flow_id,
            Some(&task_run.execution_id),
        )
    }

    /// `key` is the record key of the indexer; a missing key is never skipped.
    pub fn skip_indexer_record(&self, key: Option<&str>) -> bool {
        key.is_some_and(|key| self.lists.read().indexer_records.contains(key))
    }

    /// Tenant, then namespace, then flow, then execution id.
    pub fn should_skip(
        &self,
        tenant: Option<&str>,
        namespace: &str,
        flow: &str,
        execution_id: Option<&str>,
    ) -> bool {
        let lists = self.lists.read();

        if tenant.is_some_and(|t| lists.tenants.contains(t)) {
            return true;
        }
        if let Some(tenant) = tenant {
            let key = NamespaceSkip {
                tenant: tenant.to_string(),
                namespace: namespace.to_string(),
            };
            if lists.namespaces.contains(&key) {
                return true;
            }
        }
        if lists.flows.iter().any(|f| f.matches(tenant, namespace, flow)) {
            return true;
        }
        execution_id.is_some_and(|id| lists.executions.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Flow, Task};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn execution(tenant: Option<&str>, namespace: &str, flow: &str) -> Execution {
        let mut flow = Flow::new(namespace, flow, vec![Task::runnable("a")]);
        if let Some(tenant) = tenant {
            flow = flow.with_tenant(tenant);
        }
        Execution::new_for(&flow)
    }

    #[test]
    fn test_empty_service_skips_nothing() {
        let service = SkipExecutionService::new();
        assert!(!service.skip_execution(&execution(Some("main"), "company.team", "hello")));
        assert!(!service.skip_indexer_record(None));
    }

    #[test]
    fn test_skip_by_execution_id() {
        let service = SkipExecutionService::new();
        let target = execution(None, "company.team", "hello");
        service.set_skip_executions(&[target.id.clone()]);

        assert!(service.skip_execution(&target));
        assert!(service.skip_execution_id(&target.id));
        assert!(!service.skip_execution(&execution(None, "company.team", "hello")));
    }

    #[test]
    fn test_skip_flows_three_and_two_parts() {
        let service = SkipExecutionService::new();
        service.set_skip_flows(&strings(&["main|company.team|broken", "company.team|flaky"]));

        assert!(service.skip_execution(&execution(Some("main"), "company.team", "broken")));
        assert!(!service.skip_execution(&execution(Some("other"), "company.team", "broken")));
        assert!(service.skip_execution(&execution(Some("other"), "company.team", "flaky")));
        assert!(service.skip_execution(&execution(None, "company.team", "flaky")));
    }

    #[test]
    fn test_skip_namespace_and_tenant() {
        let service = SkipExecutionService::new();
        service.set_skip_namespaces(&strings(&["main|company.noisy"]));
        service.set_skip_tenants(&strings(&["banned"]));

        assert!(service.skip_execution(&execution(Some("main"), "company.noisy", "any")));
        assert!(!service.skip_execution(&execution(Some("main"), "company.team", "any")));
        assert!(service.skip_execution(&execution(Some("banned"), "company.team", "any")));
        assert!(!service.skip_execution(&execution(None, "company.noisy", "any")));
    }

    #[test]
    fn test_malformed_entries_are_dropped() {
        let service = SkipExecutionService::new();
        service.set_skip_flows(&strings(&["only-one-part", "a|b|c|d", "company.team|ok"]));
        service.set_skip_namespaces(&strings(&["no-tenant"]));

        assert!(service.skip_execution(&execution(None, "company.team", "ok")));
        assert!(!service.skip_execution(&execution(None, "no-tenant", "x")));
    }

    #[test]
    fn test_lists_are_replaced_wholesale() {
        let service = SkipExecutionService::new();
        service.set_skip_tenants(&strings(&["first"]));
        service.set_skip_tenants(&strings(&["second"]));

        assert!(!service.skip_execution(&execution(Some("first"), "ns", "f")));
        assert!(service.skip_execution(&execution(Some("second"), "ns", "f")));
    }

    #[test]
    fn test_task_run_uses_its_execution_identity() {
        let service = SkipExecutionService::new();
        let target = execution(Some("main"), "company.team", "hello");
        let task_run = TaskRun::new(&target, "a", None, None, None);
        service.set_skip_executions(&[target.id.clone()]);

        assert!(service.skip_task_run(&task_run));
    }

    #[test]
    fn test_indexer_records() {
        let service = SkipExecutionService::from_config(&SkipConfig {
            indexer_records: strings(&["record-1"]),
            ..SkipConfig::default()
        });

        assert!(service.skip_indexer_record(Some("record-1")));
        assert!(!service.skip_indexer_record(Some("record-2")));
        assert!(!service.skip_indexer_record(None));
    }
}

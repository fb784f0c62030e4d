//! # Flow Topology
//!
//! A flow is a tree of tasks. Leaves are dispatched to workers, every other
//! task is a *flowable* whose children are sequenced by the executor. The set
//! of flowable kinds is closed: each one is a variant of [`TaskKind`] and the
//! state machine dispatches on it with a single `match`.

use crate::error::{FlowlineError, FlowlineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Longest pause or retry interval a flow may declare: ten years.
pub const MAX_DELAY_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// Identity of a flow across revisions: `(tenant, namespace, flow id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowIdentity {
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
}

impl FlowIdentity {
    pub fn new(
        tenant_id: Option<&str>,
        namespace: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.map(str::to_string),
            namespace: namespace.into(),
            flow_id: flow_id.into(),
        }
    }

    /// Tenant column value; the empty string stands for "no tenant".
    pub fn tenant_key(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("")
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.tenant_key(), self.namespace, self.flow_id)
    }
}

/// What to do with a new execution when the flow's concurrency ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyBehavior {
    #[default]
    Queue,
    Cancel,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,
    #[serde(default)]
    pub behavior: ConcurrencyBehavior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub id: String,
    #[serde(default = "default_revision")]
    pub revision: i32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub errors: Vec<Task>,
    #[serde(default)]
    pub finally: Vec<Task>,
    #[serde(default)]
    pub concurrency: Option<Concurrency>,
    #[serde(default)]
    pub disabled: bool,
}

fn default_revision() -> i32 {
    1
}

impl Flow {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            tenant_id: None,
            namespace: namespace.into(),
            id: id.into(),
            revision: 1,
            tasks,
            errors: Vec::new(),
            finally: Vec::new(),
            concurrency: None,
            disabled: false,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_finally(mut self, finally: Vec<Task>) -> Self {
        self.finally = finally;
        self
    }

    pub fn with_concurrency(mut self, limit: u32, behavior: ConcurrencyBehavior) -> Self {
        self.concurrency = Some(Concurrency { limit, behavior });
        self
    }

    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity::new(self.tenant_id.as_deref(), &self.namespace, &self.id)
    }

    /// Every task of the flow, depth first, including `errors` and `finally` lists.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut out = Vec::new();
        for task in self.tasks.iter().chain(&self.errors).chain(&self.finally) {
            task.collect_into(&mut out);
        }
        out
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.all_tasks().into_iter().find(|t| t.id == task_id)
    }

    /// Structural checks performed before a flow is accepted by the executor.
    pub fn validate(&self) -> FlowlineResult<()> {
        if self.tasks.is_empty() {
            return Err(FlowlineError::ValidationError(format!(
                "Flow {} has no tasks",
                self.identity()
            )));
        }

        if let Some(concurrency) = &self.concurrency {
            if concurrency.limit == 0 {
                return Err(FlowlineError::ValidationError(
                    "Concurrency limit must be at least 1".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for task in self.all_tasks() {
            if !seen.insert(task.id.as_str()) {
                return Err(FlowlineError::ValidationError(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
            task.validate()?;
        }

        Ok(())
    }
}

/// Retry policy for runnable tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// The condition of an `If` task. Rendering templated expressions is done
/// upstream; the executor only sees a literal or a reference to an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Value(Value),
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    pub task: Task,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl DagTask {
    pub fn new(task: Task, depends_on: &[&str]) -> Self {
        Self {
            task,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskKind {
    /// Leaf task executed by a worker
    Runnable {
        #[serde(default)]
        plugin: String,
    },
    /// Leaf task handled by the executor itself, resumed manually or after `delay_ms`
    Pause {
        #[serde(default, rename = "delayMs")]
        delay_ms: Option<u64>,
    },
    Sequential {
        tasks: Vec<Task>,
    },
    Parallel {
        tasks: Vec<Task>,
        /// Maximum children running at once, 0 for unbounded
        #[serde(default)]
        concurrent: usize,
    },
    Dag {
        tasks: Vec<DagTask>,
    },
    If {
        condition: Condition,
        #[serde(default)]
        then: Vec<Task>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Task>,
    },
    ForEach {
        values: Vec<Value>,
        tasks: Vec<Task>,
        /// Iterations running at once, 0 for unbounded
        #[serde(default = "default_iteration_limit", rename = "concurrencyLimit")]
        concurrency_limit: usize,
    },
}

fn default_iteration_limit() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default)]
    pub errors: Vec<Task>,
    #[serde(default)]
    pub finally: Vec<Task>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl Task {
    fn with_kind(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            errors: Vec::new(),
            finally: Vec::new(),
            allow_failure: false,
            disabled: false,
            retry: None,
        }
    }

    pub fn runnable(id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            TaskKind::Runnable {
                plugin: String::new(),
            },
        )
    }

    pub fn pause(id: impl Into<String>, delay: Option<Duration>) -> Self {
        Self::with_kind(
            id,
            TaskKind::Pause {
                delay_ms: delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            },
        )
    }

    pub fn sequential(id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self::with_kind(id, TaskKind::Sequential { tasks })
    }

    pub fn parallel(id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self::with_kind(
            id,
            TaskKind::Parallel {
                tasks,
                concurrent: 0,
            },
        )
    }

    pub fn dag(id: impl Into<String>, tasks: Vec<DagTask>) -> Self {
        Self::with_kind(id, TaskKind::Dag { tasks })
    }

    pub fn if_(
        id: impl Into<String>,
        condition: Condition,
        then: Vec<Task>,
        otherwise: Vec<Task>,
    ) -> Self {
        Self::with_kind(
            id,
            TaskKind::If {
                condition,
                then,
                otherwise,
            },
        )
    }

    pub fn for_each(
        id: impl Into<String>,
        values: Vec<Value>,
        tasks: Vec<Task>,
        concurrency_limit: usize,
    ) -> Self {
        Self::with_kind(
            id,
            TaskKind::ForEach {
                values,
                tasks,
                concurrency_limit,
            },
        )
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        if let TaskKind::Runnable { plugin: p } = &mut self.kind {
            *p = plugin.into();
        }
        self
    }

    pub fn with_allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_finally(mut self, finally: Vec<Task>) -> Self {
        self.finally = finally;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// True for tasks whose children are sequenced by the executor.
    pub fn is_flowable(&self) -> bool {
        !matches!(
            self.kind,
            TaskKind::Runnable { .. } | TaskKind::Pause { .. }
        )
    }

    /// Direct children, in declaration order, including `errors` and `finally`.
    pub fn children(&self) -> Vec<&Task> {
        let main: Vec<&Task> = match &self.kind {
            TaskKind::Runnable { .. } | TaskKind::Pause { .. } => Vec::new(),
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks, .. }
            | TaskKind::ForEach { tasks, .. } => tasks.iter().collect(),
            TaskKind::Dag { tasks } => tasks.iter().map(|d| &d.task).collect(),
            TaskKind::If {
                then, otherwise, ..
            } => then.iter().chain(otherwise).collect(),
        };
        main.into_iter()
            .chain(&self.errors)
            .chain(&self.finally)
            .collect()
    }

    fn collect_into<'a>(&'a self, out: &mut Vec<&'a Task>) {
        out.push(self);
        for child in self.children() {
            child.collect_into(out);
        }
    }

    fn validate(&self) -> FlowlineResult<()> {
        if !self.is_flowable() && (!self.errors.is_empty() || !self.finally.is_empty()) {
            return Err(FlowlineError::ValidationError(format!(
                "Task '{}' is not flowable and cannot declare errors or finally tasks",
                self.id
            )));
        }

        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(FlowlineError::ValidationError(format!(
                    "Task '{}' retry policy needs at least one attempt",
                    self.id
                )));
            }
            check_delay(&self.id, "retry interval", retry.interval_ms)?;
        }

        if let TaskKind::Pause {
            delay_ms: Some(delay_ms),
        } = &self.kind
        {
            check_delay(&self.id, "pause delay", *delay_ms)?;
        }

        if let TaskKind::Dag { tasks } = &self.kind {
            validate_dag(&self.id, tasks)?;
        }

        Ok(())
    }
}

fn check_delay(task_id: &str, what: &str, delay_ms: u64) -> FlowlineResult<()> {
    if delay_ms > MAX_DELAY_MS {
        return Err(FlowlineError::ValidationError(format!(
            "Task '{task_id}': {what} of {delay_ms}ms exceeds the {MAX_DELAY_MS}ms maximum"
        )));
    }
    Ok(())
}

/// Rejects unknown dependencies and cycles (Kahn's algorithm).
fn validate_dag(dag_id: &str, tasks: &[DagTask]) -> FlowlineResult<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.task.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for dag_task in tasks {
        in_degree.entry(dag_task.task.id.as_str()).or_insert(0);
        for dependency in &dag_task.depends_on {
            if !ids.contains(dependency.as_str()) {
                return Err(FlowlineError::ValidationError(format!(
                    "Dag '{}': task '{}' depends on unknown task '{}'",
                    dag_id, dag_task.task.id, dependency
                )));
            }
            *in_degree.entry(dag_task.task.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(dag_task.task.id.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;

    while let Some(id) = ready.pop() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }

    if visited != tasks.len() {
        return Err(FlowlineError::ValidationError(format!(
            "Dag '{dag_id}' contains a dependency cycle"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_task_searches_nested_blocks() {
        let flow = Flow::new(
            "company.team",
            "nested",
            vec![Task::sequential(
                "seq",
                vec![Task::parallel(
                    "par",
                    vec![Task::runnable("a"), Task::runnable("b")],
                )],
            )
            .with_finally(vec![Task::runnable("cleanup")])],
        );

        assert!(flow.find_task("b").is_some());
        assert!(flow.find_task("cleanup").is_some());
        assert!(flow.find_task("missing").is_none());
        assert_eq!(flow.all_tasks().len(), 5);
    }

    #[test]
    fn test_validate_bounds_delays() {
        let too_long = Duration::from_millis(MAX_DELAY_MS + 1);
        let pause = Flow::new("company.team", "nap", vec![Task::pause("wait", Some(too_long))]);
        assert!(pause.validate().unwrap_err().to_string().contains("pause delay"));

        let retry = Flow::new(
            "company.team",
            "patient",
            vec![Task::runnable("a").with_retry(RetryPolicy::new(2, Duration::MAX))],
        );
        assert_eq!(retry.tasks[0].retry.as_ref().unwrap().interval_ms, u64::MAX);
        assert!(retry.validate().unwrap_err().to_string().contains("retry interval"));

        let fine = Flow::new(
            "company.team",
            "fine",
            vec![Task::pause("wait", Some(Duration::from_millis(MAX_DELAY_MS)))],
        );
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let flow = Flow::new(
            "company.team",
            "dup",
            vec![Task::runnable("a")],
        )
        .with_finally(vec![Task::runnable("a")]);

        assert!(matches!(
            flow.validate(),
            Err(FlowlineError::ValidationError(msg)) if msg.contains("Duplicate")
        ));
    }

    #[test]
    fn test_validate_rejects_dag_cycle() {
        let flow = Flow::new(
            "company.team",
            "cycle",
            vec![Task::dag(
                "dag",
                vec![
                    DagTask::new(Task::runnable("a"), &["c"]),
                    DagTask::new(Task::runnable("b"), &["a"]),
                    DagTask::new(Task::runnable("c"), &["b"]),
                ],
            )],
        );

        assert!(matches!(
            flow.validate(),
            Err(FlowlineError::ValidationError(msg)) if msg.contains("cycle")
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let flow = Flow::new(
            "company.team",
            "unknown",
            vec![Task::dag(
                "dag",
                vec![DagTask::new(Task::runnable("a"), &["ghost"])],
            )],
        );

        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_finally_on_runnable() {
        let flow = Flow::new(
            "company.team",
            "leaf",
            vec![Task::runnable("a").with_finally(vec![Task::runnable("b")])],
        );

        assert!(flow.validate().is_err());
    }

    #[test]
    fn test_flow_deserializes_from_json() {
        let flow: Flow = serde_json::from_value(json!({
            "namespace": "company.team",
            "id": "if-condition",
            "tasks": [{
                "id": "if",
                "type": "if",
                "condition": { "input": "param" },
                "then": [{ "id": "when-true", "type": "runnable" }],
                "else": [{ "id": "when-false", "type": "runnable" }]
            }],
            "concurrency": { "limit": 1 }
        }))
        .unwrap();

        assert_eq!(flow.revision, 1);
        assert_eq!(
            flow.concurrency.as_ref().map(|c| c.behavior),
            Some(ConcurrencyBehavior::Queue)
        );
        assert!(flow.validate().is_ok());
        assert!(matches!(
            &flow.tasks[0].kind,
            TaskKind::If { condition: Condition::Input(name), .. } if name == "param"
        ));
    }

    #[test]
    fn test_identity_display() {
        let identity = FlowIdentity::new(Some("main"), "company.team", "hello");
        assert_eq!(identity.to_string(), "main|company.team|hello");
        assert_eq!(FlowIdentity::new(None, "ns", "f").tenant_key(), "");
    }
}

use super::flow::{Flow, FlowIdentity};
use super::state::{State, StateHistory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// What started an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrigger {
    pub id: String,
    pub trigger_type: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// One run of one flow revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: i32,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    pub state: StateHistory,
    #[serde(default)]
    pub trigger: Option<ExecutionTrigger>,
}

impl Execution {
    /// A new `CREATED` execution of the given flow revision.
    pub fn new_for(flow: &Flow) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            inputs: Map::new(),
            task_run_list: Vec::new(),
            state: StateHistory::new(),
            trigger: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_trigger(mut self, trigger: ExecutionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn flow_identity(&self) -> FlowIdentity {
        FlowIdentity::new(self.tenant_id.as_deref(), &self.namespace, &self.flow_id)
    }

    pub fn current_state(&self) -> State {
        self.state.current()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    pub fn find_task_run(&self, task_run_id: Uuid) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|tr| tr.id == task_run_id)
    }

    pub fn find_task_run_mut(&mut self, task_run_id: Uuid) -> Option<&mut TaskRun> {
        self.task_run_list.iter_mut().find(|tr| tr.id == task_run_id)
    }

    pub fn find_task_runs_by_task_id(&self, task_id: &str) -> Vec<&TaskRun> {
        self.task_run_list
            .iter()
            .filter(|tr| tr.task_id == task_id)
            .collect()
    }

    /// The task run of `task_id` directly under `parent` for the given iteration.
    ///
    /// After a restart the clone is appended behind the run it replaces, so
    /// the last match wins.
    pub fn find_child(
        &self,
        parent: Option<Uuid>,
        task_id: &str,
        iteration: Option<usize>,
    ) -> Option<&TaskRun> {
        self.task_run_list.iter().rev().find(|tr| {
            tr.parent_task_run_id == parent && tr.task_id == task_id && tr.iteration == iteration
        })
    }

    /// Task runs not yet in a terminal state.
    pub fn non_terminated_task_runs(&self) -> impl Iterator<Item = &TaskRun> {
        self.task_run_list
            .iter()
            .filter(|tr| !tr.state.is_terminated())
    }
}

/// One try of a task run's work, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunAttempt {
    pub state: StateHistory,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskRunAttempt {
    pub fn running() -> Self {
        Self {
            state: StateHistory::starting_at(State::Running),
            error: None,
        }
    }
}

/// One instantiation of one task (or one iteration of a task) inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: Uuid,
    pub execution_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    pub task_id: String,
    #[serde(default)]
    pub parent_task_run_id: Option<Uuid>,
    /// Rendered iteration value for children of a `ForEach`
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub iteration: Option<usize>,
    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    pub state: StateHistory,
    /// The failed run this one replaces after an operator restart
    #[serde(default)]
    pub restarted_from: Option<Uuid>,
}

impl TaskRun {
    pub fn new(
        execution: &Execution,
        task_id: impl Into<String>,
        parent_task_run_id: Option<Uuid>,
        iteration: Option<usize>,
        value: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id: execution.id.clone(),
            tenant_id: execution.tenant_id.clone(),
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            task_id: task_id.into(),
            parent_task_run_id,
            value,
            iteration,
            attempts: Vec::new(),
            outputs: Map::new(),
            state: StateHistory::new(),
            restarted_from: None,
        }
    }

    pub fn current_state(&self) -> State {
        self.state.current()
    }

    pub fn last_attempt_mut(&mut self) -> Option<&mut TaskRunAttempt> {
        self.attempts.last_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::Task;
    use serde_json::json;

    #[test]
    fn test_new_execution_copies_flow_identity() {
        let flow = Flow::new("company.team", "hello", vec![Task::runnable("a")]).with_tenant("main");
        let execution = Execution::new_for(&flow).with_input("failed", json!(false));

        assert_eq!(execution.flow_identity(), flow.identity());
        assert_eq!(execution.current_state(), State::Created);
        assert_eq!(execution.inputs.get("failed"), Some(&json!(false)));
    }

    #[test]
    fn test_find_child_matches_parent_and_iteration() {
        let flow = Flow::new("company.team", "each", vec![Task::runnable("a")]);
        let mut execution = Execution::new_for(&flow);
        let parent = TaskRun::new(&execution, "each", None, None, None);
        let parent_id = parent.id;
        let first = TaskRun::new(&execution, "a", Some(parent_id), Some(0), Some("1".into()));
        let second = TaskRun::new(&execution, "a", Some(parent_id), Some(1), Some("2".into()));
        let second_id = second.id;
        execution.task_run_list.extend([parent, first, second]);

        assert_eq!(
            execution.find_child(Some(parent_id), "a", Some(1)).map(|tr| tr.id),
            Some(second_id)
        );
        assert!(execution.find_child(None, "a", Some(1)).is_none());
        assert_eq!(execution.find_task_runs_by_task_id("a").len(), 2);
    }

    #[test]
    fn test_find_child_prefers_the_restarted_clone() {
        let flow = Flow::new("company.team", "again", vec![Task::runnable("a")]);
        let mut execution = Execution::new_for(&flow);
        let failed = TaskRun::new(&execution, "a", None, None, None);
        let mut clone = TaskRun::new(&execution, "a", None, None, None);
        clone.restarted_from = Some(failed.id);
        let clone_id = clone.id;
        execution.task_run_list.extend([failed, clone]);

        assert_eq!(execution.find_child(None, "a", None).map(|tr| tr.id), Some(clone_id));
    }
}

//! Flow and task builders. The simulated worker reacts to the plugin name:
//! `fail` fails, `warn` ends in warning, `hold` never answers until told to,
//! `flaky:N` fails its first N attempts, anything else succeeds.

use flowline_core::models::{Flow, Task};

pub const NAMESPACE: &str = "io.flowline.tests";

pub fn flow(id: &str, tasks: Vec<Task>) -> Flow {
    Flow::new(NAMESPACE, id, tasks)
}

pub fn ok(id: &str) -> Task {
    Task::runnable(id).with_plugin("ok")
}

pub fn ko(id: &str) -> Task {
    Task::runnable(id).with_plugin("fail")
}

pub fn warn(id: &str) -> Task {
    Task::runnable(id).with_plugin("warn")
}

pub fn hold(id: &str) -> Task {
    Task::runnable(id).with_plugin("hold")
}

pub fn flaky(id: &str, failures: u32) -> Task {
    Task::runnable(id).with_plugin(format!("flaky:{failures}"))
}

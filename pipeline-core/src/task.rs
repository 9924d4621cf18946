use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::dep::Dep;

/// A single step of a [`Task`]: either a shell-command template or an in-process callable.
#[derive(Clone)]
pub enum Action {
    /// A command template expanded against the task's deps/targets (see [`crate::template`])
    /// and run through a shell.
    Command(String),
    /// An in-process callable. Only valid on thread-backed runners: routing a task carrying
    /// one of these to a process-backed grid pool is a [`crate::RunError::SerializationError`].
    Callable(Arc<dyn Fn(&Task) -> Result<(), String> + Send + Sync>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            Action::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

impl Action {
    pub fn is_callable(&self) -> bool {
        matches!(self, Action::Callable(_))
    }

    /// Runs this action, converting a panic (from a callable) into the same string shape as a
    /// returned error. Rust has no portable equivalent of Python's `traceback.format_exc()`, so
    /// the panic payload plus location stand in for a stack trace.
    pub(crate) fn run(&self, task: &Task) -> Result<(), String> {
        match self {
            Action::Command(_) => unreachable!("command actions are run by the executor, not Action::run"),
            Action::Callable(f) => {
                match panic::catch_unwind(AssertUnwindSafe(|| f(task))) {
                    Ok(result) => result,
                    Err(payload) => Err(panic_message(payload)),
                }
            },
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked with a non-string payload".to_string()
    }
}

/// An immutable unit of work in a run. Built by [`crate::dag::build`] and never mutated after.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_no: usize,
    pub name: String,
    pub actions: Vec<Action>,
    pub depends: Vec<Arc<Dep>>,
    pub targets: Vec<Arc<Dep>>,
    /// Display names for targets shown in reporter output; defaults to `targets`' names but may
    /// be a curated subset when a task produces many incidental files.
    pub visible_targets: Vec<String>,
    /// Explicit grid pool routing set at build time; `None` defers to the grid's default pool.
    pub route: Option<String>,
}

impl Task {
    pub fn new(task_no: usize, name: impl Into<String>) -> Self {
        Task {
            task_no,
            name: name.into(),
            actions: Vec::new(),
            depends: Vec::new(),
            targets: Vec::new(),
            visible_targets: Vec::new(),
            route: None,
        }
    }

    pub fn has_callable_action(&self) -> bool {
        self.actions.iter().any(Action::is_callable)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.task_no, self.name)
    }
}

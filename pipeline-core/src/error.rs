use thiserror::Error;

/// Errors raised while executing a task graph.
///
/// Action/target failures (`ActionFailed`, `TargetMissing`, `ParentFailed`) are local to a
/// single task and are carried inside a [`crate::context::TaskResult`]; they never unwind out
/// of a runner. Everything else here is an infrastructure failure that aborts the run.
#[derive(Debug, Error, Clone)]
pub enum RunError {
    #[error("task {task_no}: error executing action {action_idx}: {message}")]
    ActionFailed {
        task_no: usize,
        action_idx: usize,
        message: String,
    },

    #[error("task {task_no}: failed to produce target `{target}': {reason}")]
    TargetMissing {
        task_no: usize,
        target: String,
        reason: String,
    },

    #[error("task failed because parent task `{parent}' failed")]
    ParentFailed { task_no: usize, parent: usize },

    #[error("worker could not deserialize task: {message}")]
    DeserializationError { message: String },

    #[error("unable to serialize task {task_no} for a process-backed pool: {reason}")]
    SerializationError { task_no: usize, reason: String },

    #[error("no route to run task {task_no} and no default pool is registered")]
    NoRoute { task_no: usize },

    #[error("one or more tasks failed")]
    RunFailed,

    #[error("run interrupted")]
    Interrupted,

    #[error("task {task_no} reached a terminal state twice")]
    InvariantViolation { task_no: usize },
}

/// Errors raised while turning declared tasks into a [`crate::dag::Dag`].
#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("dependency cycle detected among tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("task `{0}' references unknown task `{1}' via a task: dependency")]
    UnknownTaskRef(String, String),
}

/// Errors raised while expanding a command template (see [`crate::template`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder `{{{0}}}' in command template")]
    UnknownPlaceholder(String),

    #[error("placeholder `{{{kind}:{index}}}' out of range (only {len} available)")]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
}

/// Errors raised by a [`crate::dep::Trackable::compare`] implementation.
#[derive(Debug, Error, Clone)]
pub enum CompareError {
    #[error("`{0}': {1}")]
    Io(String, String),

    #[error("`{0}' does not exist")]
    Missing(String),
}

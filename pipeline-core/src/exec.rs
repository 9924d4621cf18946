use std::process::Command;

use crate::context::TaskResult;
use crate::dep::Trackable;
use crate::task::{Action, Task};
use crate::template;

/// Runs every action of `task` in order, stopping at the first failure, then verifies every
/// target was produced. Never panics: a callable's panic is caught by [`Action::run`], and a
/// shell command's exit status maps to [`TaskResult::failure`] rather than unwinding.
pub fn run_task_locally(task: &Task) -> TaskResult {
    for (action_idx, action) in task.actions.iter().enumerate() {
        let outcome = match action {
            Action::Command(tmpl) => run_command(tmpl, task),
            Action::Callable(_) => action.run(task),
        };
        if let Err(message) = outcome {
            return TaskResult::failure(
                task.task_no,
                format!("error executing action {action_idx}: {message}"),
            );
        }
    }

    let mut dep_keys = Vec::with_capacity(task.targets.len());
    let mut dep_compares = Vec::with_capacity(task.targets.len());
    for target in &task.targets {
        match target.compare() {
            Ok(compare) => {
                dep_keys.push(target.name().to_string());
                dep_compares.push(compare);
            },
            Err(source) => {
                return TaskResult::failure(
                    task.task_no,
                    format!("failed to produce target `{}': {source}", target.name()),
                );
            },
        }
    }

    TaskResult::success(task.task_no, dep_keys, dep_compares)
}

fn run_command(tmpl: &str, task: &Task) -> Result<(), String> {
    let command = template::expand(tmpl, task).map_err(|e| e.to_string())?;

    let status = if cfg!(windows) {
        Command::new("cmd").arg("/C").arg(&command).status()
    } else {
        Command::new("sh").arg("-c").arg(&command).status()
    }
    .map_err(|e| format!("failed to spawn `{command}': {e}"))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!(
            "command `{command}' exited with status {}",
            status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{self, DeclaredTask};
    use std::sync::Arc;

    #[test]
    fn successful_command_produces_a_success_result() {
        let mut decl = DeclaredTask::new("ok");
        decl.actions.push(Action::Command("true".to_string()));
        let (tasks, _dag, _registry) = dag::build(vec![decl]).unwrap();
        let result = run_task_locally(&tasks[0]);
        assert!(result.is_success());
    }

    #[test]
    fn failing_command_produces_a_failure_result() {
        let mut decl = DeclaredTask::new("bad");
        decl.actions.push(Action::Command("false".to_string()));
        let (tasks, _dag, _registry) = dag::build(vec![decl]).unwrap();
        let result = run_task_locally(&tasks[0]);
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("action 0"));
    }

    #[test]
    fn panicking_callable_is_caught_and_reported() {
        let mut decl = DeclaredTask::new("panics");
        decl.actions.push(Action::Callable(Arc::new(|_task: &Task| {
            panic!("boom");
        })));
        let (tasks, _dag, _registry) = dag::build(vec![decl]).unwrap();
        let result = run_task_locally(&tasks[0]);
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("boom"));
    }

    #[test]
    fn missing_target_is_reported_as_failure() {
        let mut decl = DeclaredTask::new("no_target");
        decl.actions.push(Action::Command("true".to_string()));
        decl.targets.push("/nonexistent/path/for/test".to_string());
        let (tasks, _dag, _registry) = dag::build(vec![decl]).unwrap();
        let result = run_task_locally(&tasks[0]);
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("failed to produce target"));
    }

    #[test]
    fn stops_after_first_failing_action() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let ran_second = Arc::new(AtomicBool::new(false));
        let flag = ran_second.clone();

        let mut decl = DeclaredTask::new("short_circuit");
        decl.actions.push(Action::Callable(Arc::new(|_| Err("first fails".to_string()))));
        decl.actions.push(Action::Callable(Arc::new(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })));
        let (tasks, _dag, _registry) = dag::build(vec![decl]).unwrap();
        let result = run_task_locally(&tasks[0]);
        assert!(!result.is_success());
        assert!(!ran_second.load(Ordering::SeqCst));
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::RunContext;
use crate::error::RunError;
use crate::exec;

use super::{dispatch_gate, GateOutcome, Runner};

/// Single-threaded drainer: no channels, no worker threads. Also what [`super::default`]
/// returns for `jobs < 2`.
pub struct SerialLocalRunner {
    quit_early: bool,
    interrupted: Option<Arc<AtomicBool>>,
}

impl SerialLocalRunner {
    pub fn new() -> Self {
        SerialLocalRunner {
            quit_early: true,
            interrupted: None,
        }
    }

    pub fn with_quit_early(quit_early: bool) -> Self {
        SerialLocalRunner {
            quit_early,
            interrupted: None,
        }
    }

    /// Shares a SIGINT flag installed by the CLI; checked at the top of every iteration and
    /// treated the same as a quit-early failure, surfacing as `RunError::Interrupted`.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }
}

impl Default for SerialLocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for SerialLocalRunner {
    fn run_tasks(&mut self, ctx: &mut RunContext, mut ready: VecDeque<usize>) -> Result<(), RunError> {
        let mut any_failed = false;

        while let Some(idx) = ready.pop_back() {
            if self.interrupted.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
                return Err(RunError::Interrupted);
            }

            let idx = match dispatch_gate(ctx, idx, &mut ready)? {
                GateOutcome::Dispatch(idx) => idx,
                GateOutcome::Deferred => continue,
                GateOutcome::Skipped => {
                    any_failed = true;
                    continue;
                },
            };

            ctx.handle_task_started(idx);
            let result = exec::run_task_locally(ctx.task(idx));
            let failed = !result.is_success();
            ctx.handle_task_result(result)?;

            if failed {
                any_failed = true;
                if self.quit_early {
                    break;
                }
            }
        }

        if any_failed {
            Err(RunError::RunFailed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{self, DeclaredTask};
    use crate::reporter::ConsoleReporter;
    use crate::skip::SkipStore;
    use crate::task::Action;
    use std::collections::VecDeque;

    fn ctx_for(declared: Vec<DeclaredTask>, path: &std::path::Path) -> RunContext {
        let (tasks, dag, _registry) = dag::build(declared).unwrap();
        RunContext::new(
            tasks,
            dag,
            std::sync::Arc::new(ConsoleReporter::new()),
            SkipStore::open(Some(path.to_path_buf())),
        )
    }

    #[test]
    fn runs_linear_chain_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DeclaredTask::new("a");
        a.actions.push(Action::Command("true".to_string()));
        let mut b = DeclaredTask::new("b");
        b.depends.push("task:a".to_string());
        b.actions.push(Action::Command("true".to_string()));

        let mut ctx = ctx_for(vec![a, b], &dir.path().join("fp.json"));
        let order = ctx.dag().reverse_topological_order();
        let ready: VecDeque<usize> = order.into_iter().collect();

        let mut runner = SerialLocalRunner::new();
        runner.run_tasks(&mut ctx, ready).unwrap();

        assert_eq!(ctx.completed_tasks().len(), 2);
        assert!(ctx.failed_tasks().is_empty());
    }

    #[test]
    fn failed_parent_fails_child_without_running_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DeclaredTask::new("a");
        a.actions.push(Action::Command("false".to_string()));
        let mut b = DeclaredTask::new("b");
        b.depends.push("task:a".to_string());
        b.actions.push(Action::Command("true".to_string()));

        let mut ctx = ctx_for(vec![a, b], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut runner = SerialLocalRunner::with_quit_early(false);
        let result = runner.run_tasks(&mut ctx, ready);

        assert!(result.is_err());
        assert!(ctx.failed_tasks().contains(&0));
        assert!(ctx.failed_tasks().contains(&1));
        assert!(ctx.completed_tasks().is_empty());
    }
}

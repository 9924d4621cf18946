use std::collections::VecDeque;

use crate::context::RunContext;
use crate::dep::Trackable;
use crate::error::RunError;

use super::Runner;

/// Non-executing runner: prints each ready task's number, name, and a typed listing of its
/// dependencies/targets. Produces no `TaskResult`s and never touches the coordinator's sets.
pub struct DryRunner;

impl DryRunner {
    pub fn new() -> Self {
        DryRunner
    }
}

impl Default for DryRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for DryRunner {
    fn run_tasks(&mut self, ctx: &mut RunContext, ready: VecDeque<usize>) -> Result<(), RunError> {
        for idx in &ready {
            let task = ctx.task(*idx);
            println!("{} - {}", task.task_no, task.name);
            for dep in &task.depends {
                println!("  depends [{}] {}", dep.kind(), dep.name());
            }
            for target in &task.targets {
                println!("  targets [{}] {}", target.kind(), target.name());
            }
        }
        Ok(())
    }
}

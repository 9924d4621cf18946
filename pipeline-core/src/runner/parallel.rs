use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::context::{RunContext, TaskResult};
use crate::error::RunError;
use crate::exec;
use crate::reporter::Reporter;
use crate::task::Task;

use super::{dispatch_gate, GateOutcome, Runner};

enum Payload {
    Task(Arc<Task>),
    Stop,
}

/// Fixed-size thread pool sharing one work channel and one result channel, built on
/// `crossbeam_channel::unbounded`. Because workers are threads in this process's address space,
/// a task is handed over as `Arc<Task>` rather than byte-serialized.
pub struct ParallelLocalRunner {
    jobs: usize,
    quit_early: bool,
    interrupted: Option<Arc<AtomicBool>>,
}

impl ParallelLocalRunner {
    pub fn new(jobs: usize) -> Self {
        ParallelLocalRunner {
            jobs: jobs.max(1),
            quit_early: true,
            interrupted: None,
        }
    }

    pub fn with_quit_early(jobs: usize, quit_early: bool) -> Self {
        ParallelLocalRunner {
            jobs: jobs.max(1),
            quit_early,
            interrupted: None,
        }
    }

    /// Shares a SIGINT flag installed by the CLI; checked alongside `quit_early` at the top of
    /// the fill/drain loop.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    fn spawn_workers(
        &self,
        work_rx: Receiver<Payload>,
        result_tx: Sender<TaskResult>,
        reporter: Arc<dyn Reporter>,
        stop: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.jobs)
            .map(|_| {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let reporter = Arc::clone(&reporter);
                let stop = Arc::clone(&stop);
                thread::spawn(move || worker_loop(&work_rx, &result_tx, reporter.as_ref(), &stop))
            })
            .collect()
    }
}

fn worker_loop(
    work_rx: &Receiver<Payload>,
    result_tx: &Sender<TaskResult>,
    reporter: &dyn Reporter,
    stop: &AtomicBool,
) {
    while let Ok(payload) = work_rx.recv() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        match payload {
            Payload::Stop => return,
            Payload::Task(task) => {
                if let Some(crate::task::Action::Command(tmpl)) = task.actions.first() {
                    reporter.task_command(task.task_no, tmpl);
                }
                let result = exec::run_task_locally(&task);
                if result_tx.send(result).is_err() {
                    return;
                }
            },
        }
    }
}

impl Runner for ParallelLocalRunner {
    fn run_tasks(&mut self, ctx: &mut RunContext, mut ready: VecDeque<usize>) -> Result<(), RunError> {
        let (work_tx, work_rx) = unbounded::<Payload>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();
        let stop = Arc::new(AtomicBool::new(false));
        let reporter = ctx.reporter_handle();

        let mut workers = self.spawn_workers(work_rx.clone(), result_tx.clone(), reporter, stop.clone());

        let mut n_to_do = 0usize;
        let mut any_failed = false;
        let mut terminated = false;
        let mut was_interrupted = false;

        loop {
            if self.interrupted.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
                terminated = true;
                was_interrupted = true;
                while work_rx.try_recv().is_ok() {}
                stop.store(true, Ordering::Release);
                break;
            }

            let mut dispatched_this_pass = false;
            let passes = ready.len();
            for _ in 0..passes {
                let Some(idx) = ready.pop_back() else { break };
                match dispatch_gate(ctx, idx, &mut ready)? {
                    GateOutcome::Dispatch(idx) => {
                        ctx.handle_task_started(idx);
                        let task = Arc::new(ctx.task(idx).clone());
                        n_to_do += 1;
                        dispatched_this_pass = true;
                        if work_tx.send(Payload::Task(task)).is_err() {
                            n_to_do -= 1;
                        }
                    },
                    GateOutcome::Deferred => {},
                    GateOutcome::Skipped => {
                        any_failed = true;
                    },
                }
            }

            if n_to_do == 0 {
                if ready.is_empty() {
                    break;
                }
                if !dispatched_this_pass {
                    // Every remaining task is waiting on a parent still in flight elsewhere;
                    // nothing to receive, so looping again would spin. This only happens once
                    // all in-flight work has drained, at which point ready must be empty too.
                    break;
                }
                continue;
            }

            let result = result_rx.recv().map_err(|_| RunError::Interrupted)?;
            n_to_do -= 1;
            let failed = !result.is_success();
            ctx.handle_task_result(result)?;

            if failed {
                any_failed = true;
                if self.quit_early {
                    terminated = true;
                    while work_rx.try_recv().is_ok() {}
                    stop.store(true, Ordering::Release);
                    break;
                }
            }
        }

        if terminated {
            stop.store(true, Ordering::Release);
        }
        for _ in 0..workers.len() {
            let _ = work_tx.send(Payload::Stop);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        if was_interrupted {
            Err(RunError::Interrupted)
        } else if any_failed {
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

    fn ctx_for(declared: Vec<DeclaredTask>, path: &std::path::Path) -> RunContext {
        let (tasks, dag, _registry) = dag::build(declared).unwrap();
        RunContext::new(
            tasks,
            dag,
            Arc::new(ConsoleReporter::new()),
            SkipStore::open(Some(path.to_path_buf())),
        )
    }

    #[test]
    fn runs_independent_tasks_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut declared = Vec::new();
        for i in 0..8 {
            let mut t = DeclaredTask::new(format!("t{i}"));
            t.actions.push(Action::Command("true".to_string()));
            declared.push(t);
        }
        let mut ctx = ctx_for(declared, &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut runner = ParallelLocalRunner::new(4);
        runner.run_tasks(&mut ctx, ready).unwrap();

        assert_eq!(ctx.completed_tasks().len(), 8);
    }

    #[test]
    fn diamond_dag_respects_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DeclaredTask::new("a");
        a.actions.push(Action::Command("true".to_string()));
        let mut b = DeclaredTask::new("b");
        b.depends.push("task:a".to_string());
        b.actions.push(Action::Command("true".to_string()));
        let mut c = DeclaredTask::new("c");
        c.depends.push("task:a".to_string());
        c.actions.push(Action::Command("true".to_string()));
        let mut d = DeclaredTask::new("d");
        d.depends.push("task:b".to_string());
        d.depends.push("task:c".to_string());
        d.actions.push(Action::Command("true".to_string()));

        let mut ctx = ctx_for(vec![a, b, c, d], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut runner = ParallelLocalRunner::new(3);
        runner.run_tasks(&mut ctx, ready).unwrap();

        assert_eq!(ctx.completed_tasks().len(), 4);
    }

    #[test]
    fn failure_fails_dependents_without_running_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DeclaredTask::new("a");
        a.actions.push(Action::Command("false".to_string()));
        let mut b = DeclaredTask::new("b");
        b.depends.push("task:a".to_string());
        b.actions.push(Action::Command("true".to_string()));

        let mut ctx = ctx_for(vec![a, b], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut runner = ParallelLocalRunner::with_quit_early(2, false);
        let result = runner.run_tasks(&mut ctx, ready);

        assert!(result.is_err());
        assert!(ctx.failed_tasks().contains(&0));
        assert!(ctx.failed_tasks().contains(&1));
    }
}

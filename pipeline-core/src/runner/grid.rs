use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::context::{RunContext, TaskResult};
use crate::dep::Trackable;
use crate::error::RunError;
use crate::exec;
use crate::reporter::Reporter;
use crate::task::{Action, Task};

use super::{dispatch_gate, GateOutcome, Runner};

/// Wire format for a task crossing a process-backed pool's stdin/stdout pipe. Only
/// `Action::Command` tasks can be represented this way; `TaskRef` dependencies are dropped at
/// build time in [`crate::dep::Dep::to_wire_string`] before this struct is ever constructed.
#[derive(Debug, Serialize, Deserialize)]
struct WireTask {
    task_no: usize,
    name: String,
    command: String,
    depends: Vec<String>,
    targets: Vec<String>,
}

impl WireTask {
    fn from_task(task: &Task) -> Result<Self, RunError> {
        let command = match task.actions.first() {
            Some(Action::Command(cmd)) => cmd.clone(),
            Some(Action::Callable(_)) => {
                return Err(RunError::SerializationError {
                    task_no: task.task_no,
                    reason: "callable actions cannot cross a process boundary".to_string(),
                })
            },
            None => String::new(),
        };

        let mut depends = Vec::with_capacity(task.depends.len());
        for dep in &task.depends {
            depends.push(dep.to_wire_string().ok_or_else(|| RunError::SerializationError {
                task_no: task.task_no,
                reason: format!("dependency `{}' cannot cross a process boundary", dep.name()),
            })?);
        }
        let mut targets = Vec::with_capacity(task.targets.len());
        for target in &task.targets {
            targets.push(target.to_wire_string().ok_or_else(|| RunError::SerializationError {
                task_no: task.task_no,
                reason: format!("target `{}' cannot cross a process boundary", target.name()),
            })?);
        }

        Ok(WireTask {
            task_no: task.task_no,
            name: task.name.clone(),
            command,
            depends,
            targets,
        })
    }

    fn into_task(self) -> Result<Task, RunError> {
        crate::dag::build_standalone_task(self.task_no, self.name, self.command, self.depends, self.targets)
            .map_err(|e| RunError::DeserializationError { message: e.to_string() })
    }
}

/// Runs the hidden `--worker` subcommand: reads one JSON [`WireTask`] per stdin line, executes
/// it locally, writes one JSON [`TaskResult`] per stdout line, until EOF.
pub fn worker_main<R: BufRead, W: Write>(input: R, mut output: W) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<WireTask>(&line) {
            Ok(wire) => match wire.into_task() {
                Ok(task) => exec::run_task_locally(&task),
                Err(e) => TaskResult::deserialization_error(e.to_string()),
            },
            Err(e) => TaskResult::deserialization_error(e.to_string()),
        };
        let encoded = serde_json::to_string(&result)?;
        writeln!(output, "{encoded}")?;
        output.flush()?;
    }
    Ok(())
}

/// Either a thread-backed or OS-process-backed worker pool, unified behind a common interface
/// the grid runner dispatches and collects through.
pub enum PoolKind {
    Thread,
    /// `program` is the binary to re-exec in `--worker` mode (normally `std::env::current_exe`).
    Process { program: std::path::PathBuf },
}

pub struct PoolConfig {
    pub name: String,
    pub workers: usize,
    pub kind: PoolKind,
}

impl PoolConfig {
    pub fn thread(name: impl Into<String>, workers: usize) -> Self {
        PoolConfig {
            name: name.into(),
            workers: workers.max(1),
            kind: PoolKind::Thread,
        }
    }

    pub fn process(name: impl Into<String>, workers: usize, program: std::path::PathBuf) -> Self {
        PoolConfig {
            name: name.into(),
            workers: workers.max(1),
            kind: PoolKind::Process { program },
        }
    }
}

enum Payload {
    Task(Arc<Task>),
    Stop,
}

/// A registered pool's live handles: the work/result channels every flavor shares, plus
/// flavor-specific worker state.
struct Pool {
    name: String,
    work_tx: Sender<Payload>,
    work_rx: Receiver<Payload>,
    result_rx: Receiver<TaskResult>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    children: Vec<Child>,
}

impl Pool {
    fn spawn_thread_pool(name: String, workers: usize, reporter: Arc<dyn Reporter>) -> Self {
        let (work_tx, work_rx) = unbounded::<Payload>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();
        let stop = Arc::new(AtomicBool::new(false));

        let threads = (0..workers)
            .map(|_| {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let reporter = Arc::clone(&reporter);
                thread::spawn(move || {
                    while let Ok(payload) = work_rx.recv() {
                        match payload {
                            Payload::Stop => return,
                            Payload::Task(task) => {
                                if let Some(Action::Command(cmd)) = task.actions.first() {
                                    reporter.task_command(task.task_no, cmd);
                                }
                                let result = exec::run_task_locally(&task);
                                if result_tx.send(result).is_err() {
                                    return;
                                }
                            },
                        }
                    }
                })
            })
            .collect();

        Pool {
            name,
            work_tx,
            work_rx,
            result_rx,
            stop,
            threads,
            children: Vec::new(),
        }
    }

    fn spawn_process_pool(name: String, workers: usize, program: std::path::PathBuf) -> std::io::Result<Self> {
        let (work_tx, work_rx) = unbounded::<Payload>();
        let (result_tx, result_rx) = unbounded::<TaskResult>();
        let stop = Arc::new(AtomicBool::new(false));
        let mut children = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for _ in 0..workers {
            let mut child = Command::new(&program)
                .arg("--worker")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()?;
            let stdin = child.stdin.take().expect("piped stdin");
            let stdout = child.stdout.take().expect("piped stdout");

            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            threads.push(thread::spawn(move || {
                run_process_worker(work_rx, result_tx, stdin, stdout);
            }));
            children.push(child);
        }

        Ok(Pool {
            name,
            work_tx,
            work_rx,
            result_rx,
            stop,
            threads,
            children,
        })
    }

    fn terminate(&mut self) {
        while self.work_rx.try_recv().is_ok() {}
        self.stop.store(true, Ordering::Release);
        for _ in 0..self.threads.len() {
            let _ = self.work_tx.send(Payload::Stop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for mut child in self.children.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn cleanup(&mut self) {
        for _ in 0..self.threads.len().max(self.children.len()) {
            let _ = self.work_tx.send(Payload::Stop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for mut child in self.children.drain(..) {
            drop(child.stdin.take());
            let _ = child.wait();
        }
    }
}

fn run_process_worker(work_rx: Receiver<Payload>, result_tx: Sender<TaskResult>, mut stdin: ChildStdin, stdout: std::process::ChildStdout) {
    let mut reader = BufReader::new(stdout);
    while let Ok(payload) = work_rx.recv() {
        let task = match payload {
            Payload::Stop => {
                drop(stdin);
                return;
            },
            Payload::Task(task) => task,
        };

        let wire = match WireTask::from_task(&task) {
            Ok(wire) => wire,
            Err(e) => {
                let _ = result_tx.send(TaskResult::failure(task.task_no, e.to_string()));
                continue;
            },
        };

        let line = match serde_json::to_string(&wire) {
            Ok(line) => line,
            Err(e) => {
                let _ = result_tx.send(TaskResult::failure(task.task_no, e.to_string()));
                continue;
            },
        };

        if writeln!(stdin, "{line}").is_err() {
            let _ = result_tx.send(TaskResult::failure(task.task_no, "worker stdin closed"));
            return;
        }

        let mut response = String::new();
        if reader.read_line(&mut response).unwrap_or(0) == 0 {
            let _ = result_tx.send(TaskResult::failure(task.task_no, "worker stdout closed"));
            return;
        }
        match serde_json::from_str::<TaskResult>(response.trim()) {
            Ok(result) => {
                let _ = result_tx.send(result);
            },
            Err(e) => {
                let _ = result_tx.send(TaskResult::failure(task.task_no, e.to_string()));
            },
        }
    }
}

/// Generalizes the fixed worker pool of [`super::parallel::ParallelLocalRunner`] to multiple
/// named, heterogeneous pools. A task's explicit `route` overrides the default pool; absence of
/// either is `RunError::NoRoute`.
pub struct GridRunner {
    pools: Vec<Pool>,
    default_pool: Option<usize>,
    quit_early: bool,
    interrupted: Option<Arc<AtomicBool>>,
}

impl GridRunner {
    pub fn new() -> Self {
        GridRunner {
            pools: Vec::new(),
            default_pool: None,
            quit_early: true,
            interrupted: None,
        }
    }

    pub fn with_quit_early(quit_early: bool) -> Self {
        GridRunner {
            pools: Vec::new(),
            default_pool: None,
            quit_early,
            interrupted: None,
        }
    }

    /// Shares a SIGINT flag installed by the CLI; checked at the top of the fill/drain loop
    /// alongside `quit_early`.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    pub fn add_worker(&mut self, config: PoolConfig, reporter: Arc<dyn Reporter>, make_default: bool) -> std::io::Result<()> {
        if make_default && self.default_pool.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("pool '{}' cannot be default: a default pool is already registered", config.name),
            ));
        }
        let pool = match config.kind {
            PoolKind::Thread => Pool::spawn_thread_pool(config.name, config.workers, reporter),
            PoolKind::Process { program } => Pool::spawn_process_pool(config.name, config.workers, program)?,
        };
        if make_default || self.default_pool.is_none() {
            self.default_pool = Some(self.pools.len());
        }
        self.pools.push(pool);
        Ok(())
    }

    fn route(&self, task: &Task) -> Option<usize> {
        if let Some(name) = &task.route {
            return self.pools.iter().position(|p| &p.name == name);
        }
        self.default_pool
    }
}

impl Default for GridRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for GridRunner {
    fn run_tasks(&mut self, ctx: &mut RunContext, mut ready: VecDeque<usize>) -> Result<(), RunError> {
        let mut n_to_do = 0usize;
        let mut any_failed = false;
        let mut cursor = 0usize;

        loop {
            if self.interrupted.as_ref().is_some_and(|f| f.load(Ordering::SeqCst)) {
                for pool in &mut self.pools {
                    pool.terminate();
                }
                return Err(RunError::Interrupted);
            }

            let mut dispatched_this_pass = false;
            let passes = ready.len();
            for _ in 0..passes {
                let Some(idx) = ready.pop_back() else { break };
                match dispatch_gate(ctx, idx, &mut ready)? {
                    GateOutcome::Dispatch(idx) => {
                        let task = ctx.task(idx).clone();
                        let Some(pool_idx) = self.route(&task) else {
                            return Err(RunError::NoRoute { task_no: idx });
                        };
                        if task.has_callable_action() && !self.pools[pool_idx].children.is_empty() {
                            return Err(RunError::SerializationError {
                                task_no: idx,
                                reason: "callable actions cannot be routed to a process-backed pool".to_string(),
                            });
                        }
                        ctx.handle_task_started(idx);
                        if self.pools[pool_idx].work_tx.send(Payload::Task(Arc::new(task))).is_ok() {
                            n_to_do += 1;
                            dispatched_this_pass = true;
                        }
                    },
                    GateOutcome::Deferred => {},
                    GateOutcome::Skipped => {
                        any_failed = true;
                    },
                }
            }

            if n_to_do == 0 {
                if ready.is_empty() || !dispatched_this_pass {
                    break;
                }
                continue;
            }

            let result = self.recv_fair(&mut cursor);
            n_to_do -= 1;
            let failed = !result.is_success();
            ctx.handle_task_result(result)?;

            if failed {
                any_failed = true;
                if self.quit_early {
                    for pool in &mut self.pools {
                        pool.terminate();
                    }
                    return Err(RunError::RunFailed);
                }
            }
        }

        for pool in &mut self.pools {
            pool.cleanup();
        }

        if any_failed {
            Err(RunError::RunFailed)
        } else {
            Ok(())
        }
    }
}

impl GridRunner {
    /// Round-robin, non-blocking poll across every pool's result channel; sleeps briefly if all
    /// are empty rather than blocking on any single one, so a slow pool can't starve the others.
    fn recv_fair(&self, cursor: &mut usize) -> TaskResult {
        loop {
            for offset in 0..self.pools.len() {
                let idx = (*cursor + offset) % self.pools.len();
                if let Ok(result) = self.pools[idx].result_rx.try_recv() {
                    *cursor = (idx + 1) % self.pools.len();
                    return result;
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{self, DeclaredTask};
    use crate::reporter::ConsoleReporter;
    use crate::skip::SkipStore;

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
    fn routes_to_default_thread_pool_when_unrouted() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = DeclaredTask::new("t");
        t.actions.push(Action::Command("true".to_string()));
        let mut ctx = ctx_for(vec![t], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut grid = GridRunner::new();
        grid.add_worker(PoolConfig::thread("main", 2), Arc::new(ConsoleReporter::new()), true)
            .unwrap();
        grid.run_tasks(&mut ctx, ready).unwrap();

        assert_eq!(ctx.completed_tasks().len(), 1);
    }

    #[test]
    fn unrouted_task_fails_with_no_route_when_no_default_registered() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = DeclaredTask::new("t");
        t.actions.push(Action::Command("true".to_string()));
        let mut ctx = ctx_for(vec![t], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut grid = GridRunner::new();
        let result = grid.run_tasks(&mut ctx, ready);
        assert!(matches!(result, Err(RunError::NoRoute { .. })));
    }

    #[test]
    fn explicit_route_overrides_default_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = DeclaredTask::new("t");
        t.actions.push(Action::Command("true".to_string()));
        t.route = Some("special".to_string());
        let mut ctx = ctx_for(vec![t], &dir.path().join("fp.json"));
        let ready: VecDeque<usize> = ctx.dag().reverse_topological_order().into_iter().collect();

        let mut grid = GridRunner::new();
        grid.add_worker(PoolConfig::thread("main", 1), Arc::new(ConsoleReporter::new()), true)
            .unwrap();
        grid.add_worker(PoolConfig::thread("special", 1), Arc::new(ConsoleReporter::new()), false)
            .unwrap();
        grid.run_tasks(&mut ctx, ready).unwrap();

        assert_eq!(ctx.completed_tasks().len(), 1);
    }

    #[test]
    fn second_default_registration_is_rejected() {
        let mut grid = GridRunner::new();
        grid.add_worker(PoolConfig::thread("main", 1), Arc::new(ConsoleReporter::new()), true)
            .unwrap();
        let err = grid
            .add_worker(PoolConfig::thread("other", 1), Arc::new(ConsoleReporter::new()), true)
            .unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(grid.pools.len(), 1, "the rejected pool must not be registered either");
    }

    #[test]
    fn worker_main_round_trips_a_command_task() {
        let wire = WireTask {
            task_no: 0,
            name: "echo".to_string(),
            command: "true".to_string(),
            depends: vec![],
            targets: vec![],
        };
        let input = format!("{}\n", serde_json::to_string(&wire).unwrap());
        let mut output = Vec::new();
        worker_main(std::io::Cursor::new(input.into_bytes()), &mut output).unwrap();
        let result: TaskResult = serde_json::from_slice(&output).unwrap();
        assert!(result.is_success());
    }
}

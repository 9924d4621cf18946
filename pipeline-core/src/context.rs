use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dag::Dag;
use crate::dep::Trackable;
use crate::error::RunError;
use crate::reporter::Reporter;
use crate::skip::SkipStore;
use crate::task::Task;

/// Immutable outcome of running one task's actions, produced by the action executor and by
/// `dispatch_gate`'s parent-failure synthesis. Doubles as the process-backed pool's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_no: Option<usize>,
    pub error: Option<String>,
    pub dep_keys: Option<Vec<String>>,
    pub dep_compares: Option<Vec<Vec<String>>>,
}

impl TaskResult {
    pub fn success(task_no: usize, dep_keys: Vec<String>, dep_compares: Vec<Vec<String>>) -> Self {
        TaskResult {
            task_no: Some(task_no),
            error: None,
            dep_keys: Some(dep_keys),
            dep_compares: Some(dep_compares),
        }
    }

    pub fn failure(task_no: usize, error: impl Into<String>) -> Self {
        TaskResult {
            task_no: Some(task_no),
            error: Some(error.into()),
            dep_keys: None,
            dep_compares: None,
        }
    }

    pub fn parent_failed(task_no: usize, parent: usize) -> Self {
        TaskResult::failure(task_no, RunError::ParentFailed { task_no, parent }.to_string())
    }

    pub fn deserialization_error(message: impl Into<String>) -> Self {
        TaskResult {
            task_no: None,
            error: Some(message.into()),
            dep_keys: None,
            dep_compares: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Single source of truth for task status: the DAG, the task array, the disjoint
/// completed/failed sets, the reporter, and the skip backend. Only the coordinating thread of
/// whichever runner is active holds a `&mut RunContext`; its hook methods are never called
/// concurrently.
pub struct RunContext {
    tasks: Vec<Task>,
    dag: Dag,
    completed_tasks: HashSet<usize>,
    failed_tasks: HashSet<usize>,
    reporter: Arc<dyn Reporter>,
    skip_store: SkipStore,
}

impl RunContext {
    pub fn new(tasks: Vec<Task>, dag: Dag, reporter: Arc<dyn Reporter>, skip_store: SkipStore) -> Self {
        RunContext {
            tasks,
            dag,
            completed_tasks: HashSet::new(),
            failed_tasks: HashSet::new(),
            reporter,
            skip_store,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn completed_tasks(&self) -> &HashSet<usize> {
        &self.completed_tasks
    }

    pub fn failed_tasks(&self) -> &HashSet<usize> {
        &self.failed_tasks
    }

    pub fn skip_store(&self) -> &SkipStore {
        &self.skip_store
    }

    /// Clones the shared reporter handle for use by runners whose workers run off the
    /// coordinator thread (e.g. [`crate::runner::parallel::ParallelLocalRunner`]'s workers).
    pub fn reporter_handle(&self) -> Arc<dyn Reporter> {
        Arc::clone(&self.reporter)
    }

    fn is_terminal(&self, idx: usize) -> bool {
        self.completed_tasks.contains(&idx) || self.failed_tasks.contains(&idx)
    }

    pub fn handle_task_started(&self, idx: usize) {
        debug_assert!(
            !self.is_terminal(idx),
            "handle_task_started called on an already-terminal task {idx}"
        );
        if self.is_terminal(idx) {
            tracing::error!(task_no = idx, "task started after already reaching a terminal state");
        }
        self.reporter.task_running(idx);
    }

    /// Records `result`, persists successful fingerprints to the skip backend, and forwards the
    /// outcome to the reporter. Returns `Err(RunError::InvariantViolation)` if `result.task_no`
    /// is already in a terminal set, without mutating anything further.
    pub fn handle_task_result(&mut self, result: TaskResult) -> Result<(), RunError> {
        let Some(task_no) = result.task_no else {
            self.reporter.task_failed(usize::MAX, &result);
            return Ok(());
        };

        if self.is_terminal(task_no) {
            return Err(RunError::InvariantViolation { task_no });
        }

        if result.is_success() {
            self.completed_tasks.insert(task_no);
            if let (Some(keys), Some(compares)) = (&result.dep_keys, &result.dep_compares) {
                for (key, compare) in keys.iter().zip(compares.iter()) {
                    self.skip_store.record(key, compare.clone());
                }
            }
            for dep in &self.tasks[task_no].depends {
                if !dep.is_task_ref() {
                    if let Ok(compare) = dep.compare() {
                        self.skip_store.record(dep.name(), compare);
                    }
                }
            }
            self.record_task_ref_fingerprint(task_no, &result);
            self.reporter.task_ok(task_no, &result);
        } else {
            self.failed_tasks.insert(task_no);
            self.reporter.task_failed(task_no, &result);
        }

        Ok(())
    }

    /// Propagates `task_no`'s own fingerprint into every `TaskRef` dependency that points at it,
    /// so a downstream task's `task:N` dependency reflects what `N` actually produced rather
    /// than replaying the `TaskRef`'s own (still-empty) `compare()`. Falls back to the task's
    /// stable name when it has no targets to fingerprint.
    fn record_task_ref_fingerprint(&self, task_no: usize, result: &TaskResult) {
        let fingerprint = result
            .dep_compares
            .as_ref()
            .map(|compares| compares.iter().flatten().cloned().collect::<Vec<_>>())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec![self.tasks[task_no].name.clone()]);

        for task in &self.tasks {
            for dep in &task.depends {
                if let crate::dep::Dep::TaskRef(task_ref) = dep.as_ref() {
                    if task_ref.task_no == task_no {
                        task_ref.record(fingerprint.clone());
                    }
                }
            }
        }
    }

    /// Marks `idx` completed via the skip backend without running it, replaying its previously
    /// recorded fingerprints to the reporter as a "skipped" event.
    fn skip_task(&mut self, idx: usize) {
        self.completed_tasks.insert(idx);
        self.reporter.task_skipped(idx);
    }

    /// Removes from `ready` every task whose every target and dependency fingerprint is
    /// unchanged against the skip backend, marking each one completed immediately. A task with
    /// a `TaskRef` dependency is never skipped this way since its upstream fingerprint is only
    /// known once that task actually runs in this process.
    pub fn filter_stale(&mut self, ready: VecDeque<usize>) -> VecDeque<usize> {
        let mut kept = VecDeque::with_capacity(ready.len());
        for idx in ready {
            if self.task_is_unchanged(idx) {
                self.skip_task(idx);
            } else {
                kept.push_back(idx);
            }
        }
        kept
    }

    fn task_is_unchanged(&self, idx: usize) -> bool {
        let task = &self.tasks[idx];
        if task.targets.is_empty() {
            return false;
        }
        let all_trackable = task
            .depends
            .iter()
            .chain(task.targets.iter())
            .all(|d| !d.is_task_ref());
        if !all_trackable {
            return false;
        }
        task.depends
            .iter()
            .chain(task.targets.iter())
            .all(|d| self.skip_store.is_unchanged(d))
    }
}

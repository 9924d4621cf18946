use std::collections::HashMap;
use std::io::IsTerminal;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::context::TaskResult;

/// Lifecycle callbacks a runner fires as tasks move through the coordinator. Implementations
/// must make `task_running`/`task_command` appear contiguous per task, since a reporter is
/// shared across every worker of a runner.
pub trait Reporter: Send + Sync {
    fn task_running(&self, idx: usize);
    fn task_command(&self, idx: usize, command: &str);
    fn task_skipped(&self, idx: usize);
    fn task_ok(&self, idx: usize, result: &TaskResult);
    fn task_failed(&self, idx: usize, result: &TaskResult);
}

/// Default reporter: an `indicatif` progress bar per in-flight task on an interactive terminal,
/// falling back to plain `tracing` lines otherwise. All emission is serialized by one mutex so
/// that a `task_running`/`task_command` pair from one task is never interleaved with another's.
pub struct ConsoleReporter {
    inner: Mutex<ConsoleState>,
    interactive: bool,
}

struct ConsoleState {
    multi: MultiProgress,
    bars: HashMap<usize, ProgressBar>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        ConsoleReporter {
            inner: Mutex::new(ConsoleState {
                multi: MultiProgress::new(),
                bars: HashMap::new(),
            }),
            interactive: std::io::stdout().is_terminal(),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_spinner().template("{spinner} task {msg}")
    }

    fn bar_for(&self, state: &mut ConsoleState, idx: usize, label: &str) -> ProgressBar {
        let bar = state
            .bars
            .entry(idx)
            .or_insert_with(|| {
                let bar = state.multi.add(ProgressBar::new_spinner());
                bar.set_style(Self::style());
                bar
            })
            .clone();
        bar.set_message(label);
        bar
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn task_running(&self, idx: usize) {
        if self.interactive {
            let mut state = self.inner.lock();
            let bar = self.bar_for(&mut state, idx, &format!("{idx} running"));
            bar.enable_steady_tick(100);
        } else {
            tracing::info!(task_no = idx, "running");
        }
    }

    fn task_command(&self, idx: usize, command: &str) {
        if self.interactive {
            let state = self.inner.lock();
            if let Some(bar) = state.bars.get(&idx) {
                bar.set_message(&format!("{idx}: {command}"));
            }
        } else {
            tracing::info!(task_no = idx, command, "command");
        }
    }

    fn task_skipped(&self, idx: usize) {
        if self.interactive {
            let mut state = self.inner.lock();
            let bar = self.bar_for(&mut state, idx, &format!("{idx} skipped"));
            bar.finish_with_message(&format!("{idx} skipped"));
        } else {
            tracing::info!(task_no = idx, "skipped");
        }
    }

    fn task_ok(&self, idx: usize, _result: &TaskResult) {
        if self.interactive {
            let mut state = self.inner.lock();
            let bar = self.bar_for(&mut state, idx, &format!("{idx} ok"));
            bar.finish_with_message(&format!("{idx} ok"));
        } else {
            tracing::info!(task_no = idx, "ok");
        }
    }

    fn task_failed(&self, idx: usize, result: &TaskResult) {
        let message = result.error.as_deref().unwrap_or("unknown error");
        if self.interactive {
            let mut state = self.inner.lock();
            let bar = self.bar_for(&mut state, idx, &format!("{idx} failed: {message}"));
            bar.abandon_with_message(&format!("{idx} failed: {message}"));
        } else {
            tracing::warn!(task_no = idx, error = message, "failed");
        }
    }
}

/// A reporter that records every callback for test assertions instead of printing anything.
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct RecordingReporter {
    pub events: Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-support"))]
impl Reporter for RecordingReporter {
    fn task_running(&self, idx: usize) {
        self.events.lock().push(format!("running:{idx}"));
    }

    fn task_command(&self, idx: usize, command: &str) {
        self.events.lock().push(format!("command:{idx}:{command}"));
    }

    fn task_skipped(&self, idx: usize) {
        self.events.lock().push(format!("skipped:{idx}"));
    }

    fn task_ok(&self, idx: usize, _result: &TaskResult) {
        self.events.lock().push(format!("ok:{idx}"));
    }

    fn task_failed(&self, idx: usize, result: &TaskResult) {
        self.events
            .lock()
            .push(format!("failed:{idx}:{}", result.error.clone().unwrap_or_default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_captures_ordered_events() {
        let reporter = RecordingReporter::default();
        reporter.task_running(0);
        reporter.task_command(0, "echo hi");
        reporter.task_ok(0, &TaskResult::success(0, vec![], vec![]));
        let events = reporter.events.lock();
        assert_eq!(
            *events,
            vec![
                "running:0".to_string(),
                "command:0:echo hi".to_string(),
                "ok:0".to_string(),
            ]
        );
    }
}

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use pipeline_core::runner::grid::PoolConfig;
use pipeline_core::{dag, Action, ConsoleReporter, DeclaredTask, GridRunner, ParallelLocalRunner, RunContext, RunError, Runner, SerialLocalRunner, SkipStore};

fn ctx_for(declared: Vec<DeclaredTask>, fp_path: &Path) -> RunContext {
    let (tasks, graph, _registry) = dag::build(declared).unwrap();
    RunContext::new(
        tasks,
        graph,
        Arc::new(ConsoleReporter::new()),
        SkipStore::open(Some(fp_path.to_path_buf())),
    )
}

fn ready_for(ctx: &RunContext) -> VecDeque<usize> {
    ctx.dag().reverse_topological_order().into_iter().collect()
}

#[test]
fn simple_command_completes_with_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = DeclaredTask::new("noop");
    t.actions.push(Action::Command("echo true".to_string()));

    let mut ctx = ctx_for(vec![t], &dir.path().join("fp.json"));
    let ready = ready_for(&ctx);
    SerialLocalRunner::new().run_tasks(&mut ctx, ready).unwrap();

    assert!(ctx.completed_tasks().contains(&0));
    assert_eq!(ctx.completed_tasks().len(), 1);
    assert!(ctx.failed_tasks().is_empty());
}

#[test]
fn target_is_produced_by_a_dependent_command() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = dir.path().join("fixture.txt");
    std::fs::write(&fixture, "a\nb\nc\n").unwrap();
    let out = dir.path().join("out.txt");

    let mut t = DeclaredTask::new("count");
    t.depends.push(fixture.display().to_string());
    t.targets.push(out.display().to_string());
    t.actions.push(Action::Command(format!("wc -l {} > {}", fixture.display(), out.display())));

    let mut ctx = ctx_for(vec![t], &dir.path().join("fp.json"));
    let ready = ready_for(&ctx);
    SerialLocalRunner::new().run_tasks(&mut ctx, ready).unwrap();

    assert!(out.exists());
    assert_eq!(ctx.completed_tasks().len(), 1);
}

#[test]
fn parallel_runner_overlaps_independent_sleeps() {
    let dir = tempfile::tempdir().unwrap();
    let mut declared = Vec::new();
    for i in 0..8 {
        let mut t = DeclaredTask::new(format!("t{i}"));
        t.actions.push(Action::Command("sleep 0.3".to_string()));
        declared.push(t);
    }
    let mut ctx = ctx_for(declared, &dir.path().join("fp.json"));
    let ready = ready_for(&ctx);

    let start = Instant::now();
    ParallelLocalRunner::new(8).run_tasks(&mut ctx, ready).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(ctx.completed_tasks().len(), 8);
    assert!(elapsed.as_secs_f64() < 1.5, "took {elapsed:?}, expected well under 8*0.3s serial");
}

#[test]
fn quit_early_stops_before_dependent_runs() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let out2 = dir.path().join("out2.txt");

    let mut a = DeclaredTask::new("a");
    a.targets.push(out.display().to_string());
    a.actions.push(Action::Command(format!("echo blah > {} && exit 1", out.display())));

    let mut b = DeclaredTask::new("b");
    b.depends.push("task:a".to_string());
    b.actions.push(Action::Command(format!("cat {} > {}", out.display(), out2.display())));

    let mut ctx = ctx_for(vec![a, b], &dir.path().join("fp.json"));
    let ready = ready_for(&ctx);

    let result = SerialLocalRunner::with_quit_early(true).run_tasks(&mut ctx, ready);

    assert!(matches!(result, Err(RunError::RunFailed)));
    assert!(!out2.exists());
    assert!(ctx.failed_tasks().contains(&0));
    assert!(ctx.failed_tasks().contains(&1));
}

#[test]
fn unchanged_target_is_skipped_on_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let fp_path = dir.path().join("fp.json");

    let make_task = || {
        let mut t = DeclaredTask::new("touch");
        t.targets.push(out.display().to_string());
        t.actions.push(Action::Command(format!("touch {}", out.display())));
        t
    };

    let mut ctx1 = ctx_for(vec![make_task()], &fp_path);
    let ready1 = ready_for(&ctx1);
    SerialLocalRunner::new().run_tasks(&mut ctx1, ready1).unwrap();
    drop(ctx1);

    let mtime_after_first = std::fs::metadata(&out).unwrap().modified().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let mut ctx2 = ctx_for(vec![make_task()], &fp_path);
    let ready2 = ready_for(&ctx2);
    let ready2 = ctx2.filter_stale(ready2);
    assert!(ready2.is_empty(), "task should be recognized as unchanged and skipped before dispatch");
    SerialLocalRunner::new().run_tasks(&mut ctx2, ready2).unwrap();

    let mtime_after_second = std::fs::metadata(&out).unwrap().modified().unwrap();
    assert_eq!(mtime_after_first, mtime_after_second);
    assert_eq!(ctx2.completed_tasks().len(), 1);
}

#[test]
fn grid_runner_honors_explicit_route_to_a_named_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut fast = DeclaredTask::new("fast");
    fast.actions.push(Action::Command("true".to_string()));
    let mut slow = DeclaredTask::new("slow");
    slow.actions.push(Action::Command("true".to_string()));
    slow.route = Some("slow".to_string());

    let mut ctx = ctx_for(vec![fast, slow], &dir.path().join("fp.json"));
    let ready = ready_for(&ctx);

    let mut grid = GridRunner::new();
    grid.add_worker(PoolConfig::thread("fast", 2), ctx.reporter_handle(), true).unwrap();
    grid.add_worker(PoolConfig::thread("slow", 1), ctx.reporter_handle(), false).unwrap();
    grid.run_tasks(&mut ctx, ready).unwrap();

    assert_eq!(ctx.completed_tasks().len(), 2);
}

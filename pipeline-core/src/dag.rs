use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::dep::{
    Dep, DepRegistry, HugeTrackedFile, TaskRef, Trackable, TrackedDirectory, TrackedExecutable,
    TrackedFile, TrackedFilePattern, TrackedFunction, TrackedString, TrackedVariable,
    HUGE_FILE_THRESHOLD,
};
use crate::error::BuildError;
use crate::task::{Action, Task};

/// A directed acyclic graph over `task_no` values. Only task-reference dependencies induce
/// edges; file/string/etc. dependencies affect scheduling only through the skip backend.
#[derive(Debug, Default, Clone)]
pub struct Dag {
    /// `successors[u]` lists every `v` with an edge `u -> v` (v depends on u).
    successors: Vec<Vec<usize>>,
    /// `predecessors[v]` lists every `u` with an edge `u -> v`.
    predecessors: Vec<Vec<usize>>,
}

impl Dag {
    fn with_capacity(n: usize) -> Self {
        Dag {
            successors: vec![Vec::new(); n],
            predecessors: vec![Vec::new(); n],
        }
    }

    fn add_edge(&mut self, u: usize, v: usize) {
        self.successors[u].push(v);
        self.predecessors[v].push(u);
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    /// Reverse-topological order: a task appears before everything it depends on. Runners seed
    /// their ready deque with this so `pop_back` always yields a task whose predecessors were
    /// already popped earlier (i.e. are frontier-ready once completed).
    pub fn reverse_topological_order(&self) -> Vec<usize> {
        let n = self.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);

        fn visit(u: usize, dag: &Dag, visited: &mut [bool], order: &mut Vec<usize>) {
            if visited[u] {
                return;
            }
            visited[u] = true;
            for &v in dag.successors(u) {
                visit(v, dag, visited, order);
            }
            order.push(u);
        }

        for u in 0..n {
            visit(u, self, &mut visited, &mut order);
        }
        order
    }

    fn detect_cycle(&self, names: &[String]) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let n = self.len();
        let mut color = vec![Color::White; n];
        let mut stack = Vec::new();

        fn visit(
            u: usize,
            dag: &Dag,
            color: &mut [Color],
            stack: &mut Vec<usize>,
            names: &[String],
        ) -> Option<Vec<String>> {
            color[u] = Color::Gray;
            stack.push(u);
            for &v in dag.successors(u) {
                match color[v] {
                    Color::White => {
                        if let Some(cycle) = visit(v, dag, color, stack, names) {
                            return Some(cycle);
                        }
                    },
                    Color::Gray => {
                        let start = stack.iter().position(|&x| x == v).unwrap_or(0);
                        return Some(stack[start..].iter().map(|&i| names[i].clone()).collect());
                    },
                    Color::Black => {},
                }
            }
            stack.pop();
            color[u] = Color::Black;
            None
        }

        for u in 0..n {
            if color[u] == Color::White {
                if let Some(cycle) = visit(u, self, &mut color, &mut stack, names) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

/// A task as authored by a manifest, before dependency strings are resolved into [`Dep`] nodes.
#[derive(Debug, Clone, Default)]
pub struct DeclaredTask {
    pub name: String,
    pub actions: Vec<Action>,
    pub depends: Vec<String>,
    pub targets: Vec<String>,
    pub route: Option<String>,
}

impl DeclaredTask {
    pub fn new(name: impl Into<String>) -> Self {
        DeclaredTask {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Classifies a declared dependency/target string and interns it into `registry`.
pub(crate) fn resolve_dep(
    raw: &str,
    registry: &DepRegistry,
    name_to_idx: &HashMap<String, usize>,
) -> Result<Arc<Dep>, BuildError> {
    if let Some(task_name) = raw.strip_prefix("task:") {
        let idx = *name_to_idx
            .get(task_name)
            .ok_or_else(|| BuildError::UnknownTaskRef(raw.to_string(), task_name.to_string()))?;
        return Ok(registry.intern(raw, || Dep::TaskRef(TaskRef::new(idx))));
    }
    if let Some(program) = raw.strip_prefix("exe:") {
        return Ok(registry.intern(raw, || Dep::TrackedExecutable(TrackedExecutable::new(program))));
    }
    if let Some(value) = raw.strip_prefix("str:") {
        return Ok(registry.intern(raw, || Dep::TrackedString(TrackedString::new(value))));
    }
    if let Some(rest) = raw.strip_prefix("var:") {
        let (var_name, value) = rest.split_once('=').unwrap_or((rest, ""));
        return Ok(registry.intern(raw, || {
            Dep::TrackedVariable(TrackedVariable::new(var_name, value))
        }));
    }
    if let Some(rest) = raw.strip_prefix("func:") {
        let (func_name, version) = rest.split_once('@').unwrap_or((rest, ""));
        return Ok(registry.intern(raw, || {
            Dep::TrackedFunction(TrackedFunction::new(func_name, version))
        }));
    }
    if raw.contains(['*', '?', '['].as_slice()) {
        return Ok(registry.intern(raw, || Dep::TrackedFilePattern(TrackedFilePattern::new(raw))));
    }
    let path = Path::new(raw);
    if path.is_dir() {
        return Ok(registry.intern(raw, || Dep::TrackedDirectory(TrackedDirectory::new(raw))));
    }
    let huge = fs::metadata(path)
        .map(|m| m.len() > HUGE_FILE_THRESHOLD)
        .unwrap_or(false);
    if huge {
        Ok(registry.intern(raw, || Dep::HugeTrackedFile(HugeTrackedFile::new(raw))))
    } else {
        Ok(registry.intern(raw, || Dep::TrackedFile(TrackedFile::new(raw))))
    }
}

/// Builds the task array, the DAG of task-reference edges, and the dependency registry from a
/// list of declared tasks, in declaration order.
pub fn build(declared: Vec<DeclaredTask>) -> Result<(Vec<Task>, Dag, DepRegistry), BuildError> {
    let registry = DepRegistry::new();
    let names: Vec<String> = declared.iter().map(|d| d.name.clone()).collect();
    let name_to_idx: HashMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.clone(), i))
        .collect();

    let mut tasks = Vec::with_capacity(declared.len());
    let mut dag = Dag::with_capacity(declared.len());

    for (task_no, decl) in declared.into_iter().enumerate() {
        let mut task = Task::new(task_no, decl.name);
        task.actions = decl.actions;
        task.route = decl.route;

        for raw in &decl.depends {
            let dep = resolve_dep(raw, &registry, &name_to_idx)?;
            if let Dep::TaskRef(task_ref) = dep.as_ref() {
                dag.add_edge(task_ref.task_no, task_no);
            }
            task.depends.push(dep);
        }
        for raw in &decl.targets {
            let dep = resolve_dep(raw, &registry, &name_to_idx)?;
            task.targets.push(dep);
        }
        task.visible_targets = task.targets.iter().map(|d| d.name().to_string()).collect();

        tasks.push(task);
    }

    if let Some(cycle) = dag.detect_cycle(&names) {
        return Err(BuildError::Cycle(cycle));
    }

    Ok((tasks, dag, registry))
}

/// Rebuilds a single task from a process-backed grid pool's wire format: no task-ref support
/// (those can't cross a process boundary), so the name-lookup map is always empty.
pub fn build_standalone_task(
    task_no: usize,
    name: String,
    command: String,
    depends: Vec<String>,
    targets: Vec<String>,
) -> Result<Task, BuildError> {
    let registry = DepRegistry::new();
    let empty_names = HashMap::new();
    let mut task = Task::new(task_no, name);
    task.actions.push(Action::Command(command));
    for raw in &depends {
        task.depends.push(resolve_dep(raw, &registry, &empty_names)?);
    }
    for raw in &targets {
        task.targets.push(resolve_dep(raw, &registry, &empty_names)?);
    }
    task.visible_targets = task.targets.iter().map(|d| d.name().to_string()).collect();
    Ok(task)
}

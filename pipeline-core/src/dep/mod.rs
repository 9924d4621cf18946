mod registry;

pub use registry::DepRegistry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::error::CompareError;

/// Threshold (bytes) above which a tracked file is treated as "huge": size/mtime only, no hash.
pub const HUGE_FILE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Common capability set shared by every dependency/target variant: a stable name used as the
/// skip-backend key, and a `compare()` fingerprint used to decide whether the thing it tracks
/// has changed since the last successful run.
pub trait Trackable {
    fn name(&self) -> &str;
    fn compare(&self) -> Result<Vec<String>, CompareError>;
    /// Human-readable kind, used by the dry runner's listing.
    fn kind(&self) -> &'static str;
}

/// A closed variant over everything a task can depend on or produce.
#[derive(Debug)]
pub enum Dep {
    TrackedFile(TrackedFile),
    HugeTrackedFile(HugeTrackedFile),
    TrackedDirectory(TrackedDirectory),
    TrackedFilePattern(TrackedFilePattern),
    TrackedExecutable(TrackedExecutable),
    TrackedString(TrackedString),
    TrackedVariable(TrackedVariable),
    TrackedFunction(TrackedFunction),
    TaskRef(TaskRef),
}

impl Trackable for Dep {
    fn name(&self) -> &str {
        match self {
            Dep::TrackedFile(d) => d.name(),
            Dep::HugeTrackedFile(d) => d.name(),
            Dep::TrackedDirectory(d) => d.name(),
            Dep::TrackedFilePattern(d) => d.name(),
            Dep::TrackedExecutable(d) => d.name(),
            Dep::TrackedString(d) => d.name(),
            Dep::TrackedVariable(d) => d.name(),
            Dep::TrackedFunction(d) => d.name(),
            Dep::TaskRef(d) => d.name(),
        }
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        match self {
            Dep::TrackedFile(d) => d.compare(),
            Dep::HugeTrackedFile(d) => d.compare(),
            Dep::TrackedDirectory(d) => d.compare(),
            Dep::TrackedFilePattern(d) => d.compare(),
            Dep::TrackedExecutable(d) => d.compare(),
            Dep::TrackedString(d) => d.compare(),
            Dep::TrackedVariable(d) => d.compare(),
            Dep::TrackedFunction(d) => d.compare(),
            Dep::TaskRef(d) => d.compare(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Dep::TrackedFile(d) => d.kind(),
            Dep::HugeTrackedFile(d) => d.kind(),
            Dep::TrackedDirectory(d) => d.kind(),
            Dep::TrackedFilePattern(d) => d.kind(),
            Dep::TrackedExecutable(d) => d.kind(),
            Dep::TrackedString(d) => d.kind(),
            Dep::TrackedVariable(d) => d.kind(),
            Dep::TrackedFunction(d) => d.kind(),
            Dep::TaskRef(d) => d.kind(),
        }
    }
}

impl Dep {
    pub fn is_task_ref(&self) -> bool {
        matches!(self, Dep::TaskRef(_))
    }

    /// The declared-task-string form this node was classified from, used to rebuild the same
    /// `Dep` on the far side of a process-backed grid pool's wire protocol. `None` for
    /// `TaskRef`, which cannot cross a process boundary (its fingerprint only exists in this
    /// process's memory).
    pub fn to_wire_string(&self) -> Option<String> {
        match self {
            Dep::TrackedFile(d) => Some(d.path.display().to_string()),
            Dep::HugeTrackedFile(d) => Some(d.path.display().to_string()),
            Dep::TrackedDirectory(d) => Some(d.path.display().to_string()),
            Dep::TrackedFilePattern(d) => Some(d.pattern.clone()),
            Dep::TrackedExecutable(d) => Some(format!("exe:{}", d.program)),
            Dep::TrackedString(d) => Some(format!("str:{}", d.value)),
            Dep::TrackedVariable(d) => Some(format!("var:{}={}", d.var_name, d.value)),
            Dep::TrackedFunction(d) => Some(format!("func:{}@{}", d.func_name, d.version)),
            Dep::TaskRef(_) => None,
        }
    }
}

fn mtime_string(path: &Path) -> Result<String, CompareError> {
    let meta = fs::metadata(path).map_err(|e| CompareError::Io(path.display().to_string(), e.to_string()))?;
    let modified = meta
        .modified()
        .map_err(|e| CompareError::Io(path.display().to_string(), e.to_string()))?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| CompareError::Io(path.display().to_string(), e.to_string()))?
        .as_secs();
    Ok(secs.to_string())
}

fn hash_file(path: &Path) -> Result<String, CompareError> {
    let bytes = fs::read(path).map_err(|e| CompareError::Io(path.display().to_string(), e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// A file whose content hash and mtime are both part of the fingerprint.
#[derive(Debug)]
pub struct TrackedFile {
    pub path: PathBuf,
    name: String,
}

impl TrackedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        TrackedFile { path, name }
    }
}

impl Trackable for TrackedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        if !self.path.exists() {
            return Err(CompareError::Missing(self.name.clone()));
        }
        Ok(vec![mtime_string(&self.path)?, hash_file(&self.path)?])
    }

    fn kind(&self) -> &'static str {
        "File"
    }
}

/// Like [`TrackedFile`] but skips hashing: only mtime and size are compared. Used for files
/// above [`HUGE_FILE_THRESHOLD`] where reading the whole content on every run is too expensive.
#[derive(Debug)]
pub struct HugeTrackedFile {
    pub path: PathBuf,
    name: String,
}

impl HugeTrackedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        HugeTrackedFile { path, name }
    }
}

impl Trackable for HugeTrackedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        let meta = fs::metadata(&self.path)
            .map_err(|_| CompareError::Missing(self.name.clone()))?;
        Ok(vec![meta.len().to_string(), mtime_string(&self.path)?])
    }

    fn kind(&self) -> &'static str {
        "Big File"
    }
}

/// A directory, fingerprinted by a recursive digest over every file it (transitively) contains.
#[derive(Debug)]
pub struct TrackedDirectory {
    pub path: PathBuf,
    name: String,
}

impl TrackedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        TrackedDirectory { path, name }
    }
}

impl Trackable for TrackedDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        if !self.path.is_dir() {
            return Err(CompareError::Missing(self.name.clone()));
        }
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&self.path).sort_by_file_name() {
            let entry = entry.map_err(|e| CompareError::Io(self.name.clone(), e.to_string()))?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.path)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                entries.push(format!("{}:{}", rel, mtime_string(entry.path())?));
            }
        }
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.as_bytes());
        }
        Ok(vec![hex::encode(hasher.finalize())])
    }

    fn kind(&self) -> &'static str {
        "Directory"
    }
}

/// A glob pattern; the fingerprint is the sorted list of `path:mtime:size` for every match.
#[derive(Debug)]
pub struct TrackedFilePattern {
    pub pattern: String,
}

impl TrackedFilePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        TrackedFilePattern {
            pattern: pattern.into(),
        }
    }
}

impl Trackable for TrackedFilePattern {
    fn name(&self) -> &str {
        &self.pattern
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        let mut matches = Vec::new();
        let paths = glob::glob(&self.pattern)
            .map_err(|e| CompareError::Io(self.pattern.clone(), e.to_string()))?;
        for entry in paths {
            let path = entry.map_err(|e| CompareError::Io(self.pattern.clone(), e.to_string()))?;
            let meta = fs::metadata(&path)
                .map_err(|e| CompareError::Io(path.display().to_string(), e.to_string()))?;
            matches.push(format!(
                "{}:{}:{}",
                path.display(),
                mtime_string(&path)?,
                meta.len()
            ));
        }
        matches.sort();
        Ok(matches)
    }

    fn kind(&self) -> &'static str {
        "File Pattern"
    }
}

/// An executable resolved by name on `PATH`, fingerprinted like a tracked file once resolved.
#[derive(Debug)]
pub struct TrackedExecutable {
    pub program: String,
}

impl TrackedExecutable {
    pub fn new(program: impl Into<String>) -> Self {
        TrackedExecutable {
            program: program.into(),
        }
    }
}

impl Trackable for TrackedExecutable {
    fn name(&self) -> &str {
        &self.program
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        let resolved = which::which(&self.program)
            .map_err(|_| CompareError::Missing(self.program.clone()))?;
        Ok(vec![resolved.display().to_string(), hash_file(&resolved)?])
    }

    fn kind(&self) -> &'static str {
        "Executable"
    }
}

/// A literal string value; `compare()` is just the value, so any change to it invalidates
/// downstream tasks.
#[derive(Debug)]
pub struct TrackedString {
    name: String,
    pub value: String,
}

impl TrackedString {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        TrackedString {
            name: format!("string:{value}"),
            value,
        }
    }
}

impl Trackable for TrackedString {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        Ok(vec![self.value.clone()])
    }

    fn kind(&self) -> &'static str {
        "String"
    }
}

/// A named variable whose current value is supplied by the caller (e.g. a config setting) —
/// unlike [`TrackedString`], the name is stable across runs even as the value changes.
#[derive(Debug)]
pub struct TrackedVariable {
    pub var_name: String,
    pub value: String,
}

impl TrackedVariable {
    pub fn new(var_name: impl Into<String>, value: impl Into<String>) -> Self {
        TrackedVariable {
            var_name: var_name.into(),
            value: value.into(),
        }
    }
}

impl Trackable for TrackedVariable {
    fn name(&self) -> &str {
        &self.var_name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        Ok(vec![self.value.clone()])
    }

    fn kind(&self) -> &'static str {
        "Variable"
    }
}

/// A Rust function tracked by an externally supplied version tag, since there is no portable
/// way to introspect a compiled function's source the way `inspect.getsource` can in Python.
#[derive(Debug)]
pub struct TrackedFunction {
    pub func_name: String,
    pub version: String,
}

impl TrackedFunction {
    pub fn new(func_name: impl Into<String>, version: impl Into<String>) -> Self {
        TrackedFunction {
            func_name: func_name.into(),
            version: version.into(),
        }
    }
}

impl Trackable for TrackedFunction {
    fn name(&self) -> &str {
        &self.func_name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        Ok(vec![self.version.clone()])
    }

    fn kind(&self) -> &'static str {
        "Rust Function"
    }
}

/// A dependency on another task's completion. `compare()` replays that task's last recorded
/// fingerprint, set by [`crate::context::RunContext`] once the referenced task completes.
#[derive(Debug)]
pub struct TaskRef {
    pub task_no: usize,
    name: String,
    last_compare: Mutex<Vec<String>>,
}

impl TaskRef {
    pub fn new(task_no: usize) -> Self {
        TaskRef {
            task_no,
            name: format!("task:{task_no}"),
            last_compare: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, compare: Vec<String>) {
        *self.last_compare.lock().unwrap() = compare;
    }
}

impl Trackable for TaskRef {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self) -> Result<Vec<String>, CompareError> {
        Ok(self.last_compare.lock().unwrap().clone())
    }

    fn kind(&self) -> &'static str {
        "Task"
    }
}

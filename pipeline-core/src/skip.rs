use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::dep::{Dep, Trackable};

/// Default location for recorded fingerprints, relative to `dirs::data_local_dir()`.
const DEFAULT_RELATIVE_PATH: &str = "pipeline/fingerprints.json";

/// A JSON-backed record of each dependency/target's last-seen [`Trackable::compare`]
/// fingerprint, keyed by [`Trackable::name`]. Consulted by `RunContext::filter_stale` to decide
/// whether a task may be skipped before it is ever handed to a runner.
#[derive(Debug)]
pub struct SkipStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<String>>>,
    dirty: AtomicBool,
}

impl SkipStore {
    /// Default store path: `$XDG_DATA_HOME/pipeline/fingerprints.json` (or platform
    /// equivalent via `dirs::data_local_dir`), falling back to `.pipeline/fingerprints.json`
    /// under the current directory if no data-local directory can be resolved.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join(DEFAULT_RELATIVE_PATH))
            .unwrap_or_else(|| PathBuf::from(".pipeline/fingerprints.json"))
    }

    /// Opens the store at `path` (or [`Self::default_path`] if `None`), loading any existing
    /// fingerprints. A missing or corrupt file starts a fresh, empty store rather than failing
    /// the run: losing the skip cache only means extra work, never incorrect output.
    pub fn open(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(Self::default_path);
        let entries = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        SkipStore {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    /// True if `dep`'s current fingerprint matches the last one recorded for its name.
    pub fn is_unchanged(&self, dep: &Dep) -> bool {
        let current = match dep.compare() {
            Ok(c) => c,
            Err(_) => return false,
        };
        self.entries
            .lock()
            .get(dep.name())
            .is_some_and(|recorded| recorded == &current)
    }

    pub fn lookup(&self, name: &str) -> Option<Vec<String>> {
        self.entries.lock().get(name).cloned()
    }

    pub fn record(&self, name: &str, compare: Vec<String>) {
        self.entries.lock().insert(name.to_string(), compare);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Removes every recorded fingerprint whose name is in `names`, used by `pipeline clean`.
    pub fn forget(&self, names: &[String]) {
        let mut entries = self.entries.lock();
        for name in names {
            entries.remove(name);
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn flush(&self) -> Result<(), std::io::Error> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = self.entries.lock();
        let json = serde_json::to_vec_pretty(&*entries)?;
        fs::write(&self.path, json)
    }

    #[cfg(test)]
    pub(crate) fn path_for_test(path: &Path) -> Self {
        SkipStore::open(Some(path.to_path_buf()))
    }
}

impl Drop for SkipStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dep::TrackedString;

    #[test]
    fn unrecorded_dep_is_not_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipStore::path_for_test(&dir.path().join("fp.json"));
        let dep = Dep::TrackedString(TrackedString::new("hello"));
        assert!(!store.is_unchanged(&dep));
    }

    #[test]
    fn recorded_dep_is_unchanged_until_value_differs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipStore::path_for_test(&dir.path().join("fp.json"));
        let dep = Dep::TrackedString(TrackedString::new("hello"));
        store.record(dep.name(), dep.compare().unwrap());
        assert!(store.is_unchanged(&dep));

        let changed = Dep::TrackedString(TrackedString::new("world"));
        assert!(!store.is_unchanged(&changed));
    }

    #[test]
    fn flush_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fp.json");
        {
            let store = SkipStore::path_for_test(&path);
            let dep = Dep::TrackedString(TrackedString::new("hello"));
            store.record(dep.name(), dep.compare().unwrap());
            store.flush().unwrap();
        }
        let reopened = SkipStore::path_for_test(&path);
        let dep = Dep::TrackedString(TrackedString::new("hello"));
        assert!(reopened.is_unchanged(&dep));
    }

    #[test]
    fn forget_drops_recorded_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipStore::path_for_test(&dir.path().join("fp.json"));
        let dep = Dep::TrackedString(TrackedString::new("hello"));
        store.record(dep.name(), dep.compare().unwrap());
        store.forget(&[dep.name().to_string()]);
        assert!(!store.is_unchanged(&dep));
    }
}

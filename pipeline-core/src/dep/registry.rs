use std::sync::Arc;

use dashmap::DashMap;

use super::Dep;

/// Interns [`Dep`] nodes by [`Trackable::name`] so that two tasks referencing the same
/// dependency share one `Arc<Dep>` and can be compared by pointer identity.
#[derive(Debug, Default)]
pub struct DepRegistry {
    by_name: DashMap<String, Arc<Dep>>,
}

impl DepRegistry {
    pub fn new() -> Self {
        DepRegistry::default()
    }

    /// Returns the interned node for `name`, constructing it with `make` on first lookup.
    pub fn intern(&self, name: &str, make: impl FnOnce() -> Dep) -> Arc<Dep> {
        if let Some(existing) = self.by_name.get(name) {
            return Arc::clone(&existing);
        }
        let dep = Arc::new(make());
        self.by_name
            .entry(name.to_string())
            .or_insert_with(|| dep)
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Dep>> {
        self.by_name.get(name).map(|d| Arc::clone(&d))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

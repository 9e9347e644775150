//! Keeps the cache in step with mutations made through a storage.

use std::sync::Arc;

use super::{Propagator, Scanner};
use crate::error::Result;
use crate::storage::Storage;

#[derive(Debug)]
pub struct Updater {
    scanner: Arc<Scanner>,
    propagator: Arc<Propagator>,
}

impl Updater {
    pub fn new(scanner: Arc<Scanner>, propagator: Arc<Propagator>) -> Self {
        Self {
            scanner,
            propagator,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Rescan `path` after a write and propagate the change.
    pub async fn update<S: Storage + ?Sized>(&self, storage: &S, path: &str) -> Result<()> {
        let cache = self.scanner.cache();
        let old_size = cache.get(path).map(|e| e.size.max(0)).unwrap_or(0);
        let entry = self.scanner.scan(storage, path, true).await?;
        let new_size = match (entry, cache.get(path)) {
            (0, _) | (_, None) => 0,
            (_, Some(e)) => e.size.max(0),
        };
        self.propagator
            .propagate_change(path, Self::now(), new_size - old_size);
        Ok(())
    }

    /// Drop `path` from the cache after a delete.
    pub fn remove(&self, path: &str) {
        let cache = self.scanner.cache();
        let old_size = cache.get(path).map(|e| e.size.max(0)).unwrap_or(0);
        cache.remove(path);
        self.propagator.propagate_change(path, Self::now(), -old_size);
    }

    /// Move cached entries after a rename.
    pub fn rename(&self, source: &str, target: &str) {
        let cache = self.scanner.cache();
        let size = cache.get(source).map(|e| e.size.max(0)).unwrap_or(0);
        cache.move_entry(source, target);
        let now = Self::now();
        self.propagator.propagate_change(source, now, -size);
        self.propagator.propagate_change(target, now, size);
    }
}

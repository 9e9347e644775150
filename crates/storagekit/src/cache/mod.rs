//! Metadata cache boundary.
//!
//! Storages expose these handles through `Storage::cache()` and friends, but
//! never depend on their internals. The only contract storages rely on is
//! invalidation: a mutation that changes a path's content calls
//! `Storage::remove_cached_file`.
//!
//! - [`Cache`]: path-keyed metadata entries
//! - [`Scanner`]: fills the cache from storage metadata
//! - [`Watcher`]: rescans entries the storage reports as updated
//! - [`Propagator`]: bumps parent mtimes and etags after a change
//! - [`Updater`]: keeps the cache consistent after writes, deletes and renames

// RwLock.read()/write().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

mod propagator;
mod scanner;
mod updater;
mod watcher;

pub use propagator::Propagator;
pub use scanner::Scanner;
pub use updater::Updater;
pub use watcher::{WatchPolicy, Watcher};

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{FileMetadata, Permissions};

/// Cached metadata for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub name: String,
    pub mimetype: String,
    pub mtime: i64,
    pub storage_mtime: i64,
    pub size: i64,
    pub etag: String,
    pub permissions: Permissions,
}

impl CacheEntry {
    pub fn from_metadata(path: &str, meta: FileMetadata) -> Self {
        Self {
            path: path.to_string(),
            name: meta.name,
            mimetype: meta.mimetype,
            mtime: meta.mtime,
            storage_mtime: meta.storage_mtime,
            size: meta.size,
            etag: meta.etag,
            permissions: meta.permissions,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mimetype == crate::types::DIRECTORY_MIMETYPE
    }
}

/// In-memory metadata cache for one storage.
#[derive(Debug, Default)]
pub struct Cache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

fn is_within(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn clean(path: &str) -> &str {
    path.trim_matches('/')
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        self.entries.read().unwrap().get(clean(path)).cloned()
    }

    pub fn put(&self, entry: CacheEntry) {
        let key = clean(&entry.path).to_string();
        self.entries.write().unwrap().insert(key, entry);
    }

    /// Update an existing entry in place. Returns false when absent.
    pub fn update(&self, path: &str, f: impl FnOnce(&mut CacheEntry)) -> bool {
        match self.entries.write().unwrap().get_mut(clean(path)) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Remove `path` and everything below it.
    pub fn remove(&self, path: &str) {
        let path = clean(path);
        self.entries
            .write()
            .unwrap()
            .retain(|key, _| !is_within(key, path));
    }

    /// Move `source` and everything below it to `target`.
    pub fn move_entry(&self, source: &str, target: &str) {
        let (source, target) = (clean(source), clean(target));
        let mut entries = self.entries.write().unwrap();
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| is_within(key, source))
            .cloned()
            .collect();
        for key in moved {
            if let Some(mut entry) = entries.remove(&key) {
                let new_key = format!("{}{}", target, &key[source.len()..]);
                entry.path = new_key.clone();
                entry.name = crate::path::basename(&new_key).to_string();
                entries.insert(new_key, entry);
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.read().unwrap().contains_key(clean(path))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    pub(crate) fn entry(path: &str) -> CacheEntry {
        CacheEntry {
            path: path.to_string(),
            name: crate::path::basename(path).to_string(),
            mimetype: "text/plain".into(),
            mtime: 10,
            storage_mtime: 10,
            size: 3,
            etag: "e".into(),
            permissions: Permissions::ALL,
        }
    }

    #[test]
    fn test_remove_is_recursive_but_prefix_safe() {
        let cache = Cache::new();
        for path in ["a", "a/b", "a/b/c", "ab"] {
            cache.put(entry(path));
        }
        cache.remove("a");
        assert!(!cache.contains("a/b/c"));
        assert!(cache.contains("ab"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_move_entry() {
        let cache = Cache::new();
        cache.put(entry("src"));
        cache.put(entry("src/f.txt"));
        cache.move_entry("src", "dst/inner");
        assert!(!cache.contains("src"));
        let moved = cache.get("dst/inner/f.txt").unwrap();
        assert_eq!(moved.path, "dst/inner/f.txt");
        assert_eq!(moved.name, "f.txt");
        assert_eq!(cache.get("/dst/inner/").unwrap().name, "inner");
    }
}

//! Detects out-of-band changes and rescans them.

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{CacheEntry, Scanner};
use crate::error::Result;
use crate::storage::Storage;

/// When the watcher asks the storage whether a cached entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPolicy {
    /// Trust the cache.
    Never,
    /// Check each path once per watcher.
    Once,
    /// Check on every access.
    Always,
}

#[derive(Debug)]
pub struct Watcher {
    scanner: Arc<Scanner>,
    policy: WatchPolicy,
    checked: Mutex<HashSet<String>>,
}

impl Watcher {
    pub fn new(scanner: Arc<Scanner>, policy: WatchPolicy) -> Self {
        Self {
            scanner,
            policy,
            checked: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> WatchPolicy {
        self.policy
    }

    /// Rescan `path` if the storage reports it changed since `cached` was taken.
    /// Returns whether a rescan happened.
    pub async fn check_update<S: Storage + ?Sized>(
        &self,
        storage: &S,
        path: &str,
        cached: Option<&CacheEntry>,
    ) -> Result<bool> {
        let due = match self.policy {
            WatchPolicy::Never => false,
            WatchPolicy::Always => true,
            WatchPolicy::Once => self.checked.lock().unwrap().insert(path.to_string()),
        };
        if !due {
            return Ok(false);
        }
        let needs_update = match cached {
            Some(entry) if entry.storage_mtime > 0 => {
                storage.has_updated(path, entry.storage_mtime).await?
            }
            _ => true,
        };
        if needs_update {
            self.scanner
                .scan(storage, path, cached.is_some_and(CacheEntry::is_dir))
                .await?;
        }
        Ok(needs_update)
    }
}

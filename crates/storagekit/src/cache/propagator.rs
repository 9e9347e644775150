//! Propagates a change up to every cached parent.

use std::sync::Arc;

use super::Cache;
use crate::path;

#[derive(Debug)]
pub struct Propagator {
    cache: Arc<Cache>,
}

impl Propagator {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Give every cached ancestor of `path` a fresh etag, raise its mtime to
    /// `time` and adjust known sizes by `size_difference`.
    pub fn propagate_change(&self, path: &str, time: i64, size_difference: i64) {
        let mut current = path.trim_matches('/');
        while !current.is_empty() {
            current = path::dirname(current);
            self.cache.update(current, |entry| {
                entry.mtime = entry.mtime.max(time);
                entry.etag = uuid::Uuid::new_v4().simple().to_string();
                if entry.size >= 0 {
                    entry.size = (entry.size + size_difference).max(0);
                }
            });
        }
    }
}

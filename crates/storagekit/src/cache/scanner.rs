//! Fills a [`Cache`] from storage metadata.

use futures_util::future::BoxFuture;
use std::sync::Arc;

use super::{Cache, CacheEntry};
use crate::error::{ErrorKind, Result};
use crate::path;
use crate::storage::Storage;

/// Scanner bound to one storage's cache.
#[derive(Debug)]
pub struct Scanner {
    cache: Arc<Cache>,
}

impl Scanner {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.cache.clone()
    }

    /// Refresh the entry for a single path.
    ///
    /// Paths that vanished or became unreadable are dropped from the cache.
    pub async fn scan_file<S: Storage + ?Sized>(
        &self,
        storage: &S,
        path: &str,
    ) -> Result<Option<CacheEntry>> {
        match storage.get_meta_data(path).await {
            Ok(Some(meta)) => {
                let entry = CacheEntry::from_metadata(path, meta);
                self.cache.put(entry.clone());
                Ok(Some(entry))
            }
            Ok(None) => {
                self.cache.remove(path);
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.cache.remove(path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Scan `path`, descending into directories when `recursive` is set.
    /// Returns the number of entries written to the cache.
    pub async fn scan<S: Storage + ?Sized>(
        &self,
        storage: &S,
        path: &str,
        recursive: bool,
    ) -> Result<usize> {
        self.scan_tree(storage, path.to_string(), recursive, true)
            .await
    }

    fn scan_tree<'a, S: Storage + ?Sized>(
        &'a self,
        storage: &'a S,
        path: String,
        recursive: bool,
        descend: bool,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let Some(entry) = self.scan_file(storage, &path).await? else {
                return Ok(0);
            };
            let mut count = 1;
            if descend && entry.is_dir() {
                for name in storage.list_directory(&path).await? {
                    let child = path::join(&path, &name);
                    count += self
                        .scan_tree(storage, child, recursive, recursive)
                        .await?;
                }
            }
            Ok(count)
        })
    }
}

//! Advisory locking.
//!
//! Storages never lock anything themselves: they compute a canonical key and
//! hand it to a [`LockProvider`]. The key depends only on the storage identity
//! and the path, so two instances addressing the same data contend for the
//! same lock.
//!
//! ```rust
//! use std::sync::Arc;
//! use storagekit::{
//!     ErrorKind, FlysystemStorage, LockType, MemoryAdapter, MemoryLockProvider, Storage,
//!     StorageContext,
//! };
//!
//! # tokio_test::block_on(async {
//! let storage = FlysystemStorage::new(Arc::new(MemoryAdapter::new("docs")), StorageContext::default());
//! let locks = MemoryLockProvider::new();
//!
//! storage.acquire_lock("report.txt", LockType::Shared, &locks).await?;
//! let err = storage
//!     .acquire_lock("report.txt", LockType::Exclusive, &locks)
//!     .await
//!     .unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Locked);
//!
//! storage.release_lock("report.txt", LockType::Shared, &locks).await?;
//! storage.acquire_lock("report.txt", LockType::Exclusive, &locks).await?;
//! # Ok::<(), storagekit::StorageError>(())
//! # }).unwrap();
//! ```

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::LockType;

/// Lock conflict reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    /// Hashed key the provider was asked for.
    pub key: String,
    /// Readable description of the current holder, if known.
    pub existing: Option<String>,
}

/// External lock provider.
///
/// Implementations own the shared/exclusive semantics. `change_lock` must
/// switch between the two types without a window where the key is unlocked.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn acquire_lock(
        &self,
        key: &str,
        lock_type: LockType,
        readable: &str,
    ) -> Result<(), LockConflict>;

    async fn release_lock(&self, key: &str, lock_type: LockType);

    async fn change_lock(&self, key: &str, target: LockType) -> Result<(), LockConflict>;
}

/// Canonical lock key: `files/` + hex md5 of `<storage id>::<trimmed path>`.
pub fn lock_key(storage_id: &str, path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!(
        "files/{}",
        hex_digest::<Md5>(format!("{}::{}", storage_id, trimmed).as_bytes())
    )
}

/// Readable lock context passed alongside the hashed key.
pub fn lock_readable(storage_id: &str, path: &str) -> String {
    format!("{}::{}", storage_id, path)
}

pub(crate) fn hex_digest<D: Digest>(data: &[u8]) -> String {
    D::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug)]
enum LockState {
    Shared { count: usize, holder: String },
    Exclusive { holder: String },
}

/// In-process lock provider.
///
/// Shared locks are counted; an exclusive lock requires the key to be free.
/// Changing shared to exclusive only succeeds for the sole shared holder.
#[derive(Debug, Default)]
pub struct MemoryLockProvider {
    locks: Mutex<HashMap<String, LockState>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lock type on `key`, if any.
    pub fn lock_type(&self, key: &str) -> Option<LockType> {
        match self.locks.lock().unwrap().get(key) {
            Some(LockState::Shared { .. }) => Some(LockType::Shared),
            Some(LockState::Exclusive { .. }) => Some(LockType::Exclusive),
            None => None,
        }
    }

    fn conflict(key: &str, state: &LockState) -> LockConflict {
        let holder = match state {
            LockState::Shared { holder, .. } | LockState::Exclusive { holder } => holder,
        };
        LockConflict {
            key: key.to_string(),
            existing: Some(holder.clone()),
        }
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn acquire_lock(
        &self,
        key: &str,
        lock_type: LockType,
        readable: &str,
    ) -> Result<(), LockConflict> {
        let mut locks = self.locks.lock().unwrap();
        match (locks.get_mut(key), lock_type) {
            (None, LockType::Shared) => {
                locks.insert(
                    key.to_string(),
                    LockState::Shared {
                        count: 1,
                        holder: readable.to_string(),
                    },
                );
                Ok(())
            }
            (None, LockType::Exclusive) => {
                locks.insert(
                    key.to_string(),
                    LockState::Exclusive {
                        holder: readable.to_string(),
                    },
                );
                Ok(())
            }
            (Some(LockState::Shared { count, .. }), LockType::Shared) => {
                *count += 1;
                Ok(())
            }
            (Some(state), _) => Err(Self::conflict(key, state)),
        }
    }

    async fn release_lock(&self, key: &str, lock_type: LockType) {
        let mut locks = self.locks.lock().unwrap();
        let remove = match (locks.get_mut(key), lock_type) {
            (Some(LockState::Shared { count, .. }), LockType::Shared) => {
                *count -= 1;
                *count == 0
            }
            (Some(LockState::Exclusive { .. }), LockType::Exclusive) => true,
            _ => false,
        };
        if remove {
            locks.remove(key);
        }
    }

    async fn change_lock(&self, key: &str, target: LockType) -> Result<(), LockConflict> {
        let mut locks = self.locks.lock().unwrap();
        let Some(state) = locks.get_mut(key) else {
            return Err(LockConflict {
                key: key.to_string(),
                existing: None,
            });
        };
        let next = match (&*state, target) {
            (LockState::Shared { count: 1, holder }, LockType::Exclusive) => {
                LockState::Exclusive {
                    holder: holder.clone(),
                }
            }
            (LockState::Exclusive { holder }, LockType::Shared) => LockState::Shared {
                count: 1,
                holder: holder.clone(),
            },
            _ => return Err(Self::conflict(key, state)),
        };
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_format() {
        let key = lock_key("local::/data/", "/a/b.txt/");
        assert!(key.starts_with("files/"));
        assert_eq!(key.len(), "files/".len() + 32);
        assert_eq!(key, lock_key("local::/data/", "a/b.txt"));
        assert_eq!(
            key,
            format!("files/{}", hex_digest::<Md5>(b"local::/data/::a/b.txt"))
        );
    }

    #[test]
    fn test_lock_key_depends_on_identity() {
        assert_ne!(
            lock_key("local::/data/", "a.txt"),
            lock_key("local::/other/", "a.txt")
        );
    }

    #[tokio::test]
    async fn test_shared_locks_stack() {
        let provider = MemoryLockProvider::new();
        provider.acquire_lock("k", LockType::Shared, "s::a").await.unwrap();
        provider.acquire_lock("k", LockType::Shared, "s::a").await.unwrap();
        let conflict = provider
            .acquire_lock("k", LockType::Exclusive, "s::a")
            .await
            .unwrap_err();
        assert_eq!(conflict.existing.as_deref(), Some("s::a"));

        provider.release_lock("k", LockType::Shared).await;
        assert_eq!(provider.lock_type("k"), Some(LockType::Shared));
        provider.release_lock("k", LockType::Shared).await;
        assert_eq!(provider.lock_type("k"), None);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_shared() {
        let provider = MemoryLockProvider::new();
        provider
            .acquire_lock("k", LockType::Exclusive, "s::a")
            .await
            .unwrap();
        assert!(provider.acquire_lock("k", LockType::Shared, "s::a").await.is_err());
        provider.release_lock("k", LockType::Exclusive).await;
        provider.acquire_lock("k", LockType::Shared, "s::a").await.unwrap();
    }

    #[tokio::test]
    async fn test_change_lock() {
        let provider = MemoryLockProvider::new();
        provider.acquire_lock("k", LockType::Shared, "s::a").await.unwrap();
        provider.change_lock("k", LockType::Exclusive).await.unwrap();
        assert_eq!(provider.lock_type("k"), Some(LockType::Exclusive));
        provider.change_lock("k", LockType::Shared).await.unwrap();
        assert_eq!(provider.lock_type("k"), Some(LockType::Shared));

        provider.acquire_lock("k", LockType::Shared, "s::a").await.unwrap();
        assert!(provider.change_lock("k", LockType::Exclusive).await.is_err());
        assert!(provider.change_lock("missing", LockType::Shared).await.is_err());
    }
}

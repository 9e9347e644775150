//! Copy and move between storages.
//!
//! Both entry points unwrap the source first. When the innermost source is
//! the target instance itself, the operation turns into a same-storage
//! `copy` / `rename`. Otherwise content is streamed through the (wrapped)
//! source so every wrapper on the way still applies.

use futures_util::future::BoxFuture;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::path;
use crate::storage::Storage;
use crate::types::StorageKind;

/// A storage reached while unwrapping: the caller's reference or an inner `Arc`.
pub enum StorageRef<'a> {
    Borrowed(&'a dyn Storage),
    Owned(Arc<dyn Storage>),
}

impl<'a> Deref for StorageRef<'a> {
    type Target = dyn Storage + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            StorageRef::Borrowed(storage) => *storage,
            StorageRef::Owned(storage) => storage.as_ref(),
        }
    }
}

/// Peel every wrapper off `storage`, translating `path` on the way down.
pub fn unwrap_storage<'a>(storage: &'a dyn Storage, path: &str) -> (StorageRef<'a>, String) {
    let mut current = StorageRef::Borrowed(storage);
    let mut path = path.to_string();
    while let Some(inner) = current.wrapped_storage() {
        path = current.unwrapped_path(&path);
        current = StorageRef::Owned(inner);
    }
    (current, path)
}

/// Whether two references point at the same storage instance.
pub fn same_instance<S: Storage + ?Sized>(a: &S, b: &dyn Storage) -> bool {
    std::ptr::addr_eq(a as *const S, b as *const dyn Storage)
}

/// Whether a local target may take the filesystem shortcut for `source`.
///
/// Layers that transform content or narrow permissions force the generic
/// streaming path.
pub fn can_do_local_transfer(source: &dyn Storage) -> bool {
    source.is_kind(StorageKind::Local)
        && !source.is_kind(StorageKind::Encryption)
        && !source.is_kind(StorageKind::PermissionsMask)
        && !source.is_kind(StorageKind::GroupFolderAcl)
}

pub async fn copy_from_storage<S: Storage + ?Sized>(
    target: &S,
    source: &dyn Storage,
    source_path: &str,
    target_path: &str,
    preserve_mtime: bool,
) -> Result<bool> {
    let (inner, inner_path) = unwrap_storage(source, source_path);
    if same_instance(target, &*inner) {
        return target.copy(&inner_path, target_path).await;
    }
    stream_tree(target, source, source_path, target_path, preserve_mtime).await
}

/// The generic transfer: recreate directories, stream files.
pub async fn stream_tree<S: Storage + ?Sized>(
    target: &S,
    source: &dyn Storage,
    source_path: &str,
    target_path: &str,
    preserve_mtime: bool,
) -> Result<bool> {
    if source.is_dir(source_path).await? {
        let listing = source.list_directory(source_path).await?;
        // An existing target directory is fine.
        target.mkdir(target_path).await?;
        for name in listing {
            let from = path::join(source_path, &name);
            let to = path::join(target_path, &name);
            if !copy_child(target, source, from, to, preserve_mtime).await? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let reader = source.open_read(source_path).await?;
    if let Err(e) = target.write_stream(target_path, reader, None).await {
        if let Err(cleanup) = target.unlink(target_path).await {
            debug!(path = target_path, error = %cleanup, "failed to remove partial copy");
        }
        target.remove_cached_file(target_path);
        return Err(e.context(format!(
            "failed to copy {} to {}",
            source_path, target_path
        )));
    }

    if preserve_mtime {
        let mtime = source.file_mtime(source_path).await?;
        if mtime > 0 {
            match target.touch(target_path, Some(mtime)).await {
                Ok(true) => {}
                Ok(false) => debug!(path = target_path, "target does not support setting mtime"),
                Err(e) => warn!(path = target_path, error = %e, "failed to preserve mtime"),
            }
        }
    }
    Ok(true)
}

fn copy_child<'a, S: Storage + ?Sized>(
    target: &'a S,
    source: &'a dyn Storage,
    from: String,
    to: String,
    preserve_mtime: bool,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        target
            .copy_from_storage(source, &from, &to, preserve_mtime)
            .await
    })
}

pub async fn move_from_storage<S: Storage + ?Sized>(
    target: &S,
    source: &dyn Storage,
    source_path: &str,
    target_path: &str,
) -> Result<bool> {
    let (inner, inner_path) = unwrap_storage(source, source_path);
    if same_instance(target, &*inner) {
        if source.is_kind(StorageKind::PermissionsMask) && !source.is_deletable(source_path).await? {
            return Ok(false);
        }
        return target.rename(&inner_path, target_path).await;
    }
    if !source.is_deletable(source_path).await? {
        return Ok(false);
    }
    if !target
        .copy_from_storage(source, source_path, target_path, true)
        .await?
    {
        return Ok(false);
    }
    if source.is_dir(source_path).await? {
        source.rmdir(source_path).await
    } else {
        source.unlink(source_path).await
    }
}

//! Default operation bodies shared by every storage.
//!
//! Each function is generic over the storage so the trait defaults, wrappers
//! and backends that override an operation but still want the generic
//! fallback can all call the same code.

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, ForbiddenReason, Result, StorageError};
use crate::lock::{LockProvider, lock_key, lock_readable};
use crate::path;
use crate::storage::Storage;
use crate::stream::ReadStream;
use crate::types::{
    DIRECTORY_MIMETYPE, FileMetadata, FileType, HashAlgorithm, LockType, Permissions, WriteMode,
    mimetype_for,
};

const HASH_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh random etag.
pub fn random_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn is_root(path: &str) -> bool {
    path.trim_matches('/').is_empty()
}

pub async fn is_deletable<S: Storage + ?Sized>(storage: &S, path: &str) -> Result<bool> {
    if is_root(path) {
        return storage.is_updatable(path).await;
    }
    let parent = path::dirname(path.trim_matches('/'));
    Ok(storage.is_updatable(parent).await? && storage.is_updatable(path).await?)
}

pub async fn permissions<S: Storage + ?Sized>(storage: &S, path: &str) -> Result<Permissions> {
    let mut permissions = Permissions::NONE;
    permissions.set(Permissions::CREATE, storage.is_creatable(path).await?);
    permissions.set(Permissions::READ, storage.is_readable(path).await?);
    permissions.set(Permissions::UPDATE, storage.is_updatable(path).await?);
    permissions.set(Permissions::DELETE, storage.is_deletable(path).await?);
    permissions.set(Permissions::SHARE, storage.is_sharable(path).await?);
    Ok(permissions)
}

pub async fn get_mime_type<S: Storage + ?Sized>(storage: &S, path: &str) -> Result<Option<String>> {
    Ok(match storage.file_type(path).await? {
        Some(FileType::Directory) => Some(DIRECTORY_MIMETYPE.to_string()),
        Some(FileType::File) => Some(mimetype_for(path::basename(path)).to_string()),
        None => None,
    })
}

pub async fn get_meta_data<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
) -> Result<Option<FileMetadata>> {
    if storage.context().validator().is_blacklisted(path) {
        return Err(StorageError::forbidden(path, ForbiddenReason::Blacklisted));
    }
    let permissions = storage.permissions(path).await?;
    if !permissions.contains(Permissions::READ) {
        return Ok(None);
    }
    let Some(mimetype) = storage.get_mime_type(path).await? else {
        return Ok(None);
    };
    let storage_mtime = storage.file_mtime(path).await?;
    let mtime = if storage_mtime > 0 { storage_mtime } else { now() };
    let size = if mimetype == DIRECTORY_MIMETYPE {
        -1
    } else {
        i64::try_from(storage.file_size(path).await?).unwrap_or(i64::MAX)
    };
    let etag = storage.get_etag(path).await?;
    Ok(Some(FileMetadata {
        mimetype,
        mtime,
        storage_mtime,
        size,
        etag,
        permissions,
        name: path::basename(path).to_string(),
    }))
}

pub fn directory_contents<'a, S: Storage + ?Sized>(
    storage: &'a S,
    dir: &'a str,
) -> BoxStream<'a, Result<FileMetadata>> {
    stream::once(async move { storage.list_directory(dir).await })
        .map(move |listing| match listing {
            Ok(listing) => stream::iter(listing)
                .then(move |name| async move {
                    let child = path::join(dir, &name);
                    match storage.get_meta_data(&child).await {
                        Ok(Some(meta)) => Some(Ok(meta)),
                        Ok(None) => None,
                        Err(e) if matches!(e.kind(), ErrorKind::Forbidden | ErrorKind::NotFound) => {
                            debug!(path = %child, error = %e, "skipping directory entry");
                            None
                        }
                        Err(e) => Some(Err(e)),
                    }
                })
                .filter_map(|entry| async move { entry })
                .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .flatten()
        .boxed()
}

pub async fn search<S: Storage + ?Sized>(storage: &S, query: &str) -> Result<Vec<String>> {
    let query = query.to_lowercase();
    search_in_dir(storage, &query, String::new()).await
}

fn search_in_dir<'a, S: Storage + ?Sized>(
    storage: &'a S,
    query: &'a str,
    dir: String,
) -> BoxFuture<'a, Result<Vec<String>>> {
    Box::pin(async move {
        let listing = match storage.list_directory(&dir).await {
            Ok(listing) => listing,
            Err(e)
                if !dir.is_empty()
                    && matches!(e.kind(), ErrorKind::Forbidden | ErrorKind::NotFound) =>
            {
                debug!(path = %dir, error = %e, "search skipped directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let mut found = Vec::new();
        for name in listing {
            let child = path::join(&dir, &name);
            if name.to_lowercase().contains(query) {
                found.push(child.clone());
            }
            if storage.is_dir(&child).await? {
                found.extend(search_in_dir(storage, query, child).await?);
            }
        }
        Ok(found)
    })
}

pub async fn read_all<S: Storage + ?Sized>(storage: &S, path: &str) -> Result<Vec<u8>> {
    let mut reader = storage.open_read(path).await?;
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await?;
    Ok(content)
}

pub async fn write_all<S: Storage + ?Sized>(storage: &S, path: &str, data: &[u8]) -> Result<u64> {
    let mut writer = storage.open_write(path, WriteMode::Truncate).await?;
    if let Err(e) = writer.write_all(data).await {
        writer.abort();
        return Err(e.into());
    }
    writer.close().await?;
    Ok(data.len() as u64)
}

pub async fn write_stream<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    mut source: ReadStream,
    size: Option<u64>,
) -> Result<u64> {
    let mut writer = storage.open_write(path, WriteMode::Truncate).await?;
    let copied = match tokio::io::copy(&mut source, &mut writer).await {
        Ok(copied) => copied,
        Err(e) => {
            writer.abort();
            return Err(StorageError::Io(e).context(format!("failed to write stream to {}", path)));
        }
    };
    writer.close().await?;
    match size {
        Some(expected) if copied != expected => Err(StorageError::io(format!(
            "incomplete write to {}: {} of {} bytes",
            path, copied, expected
        ))),
        _ => Ok(copied),
    }
}

pub async fn remove<S: Storage + ?Sized>(storage: &S, path: &str) -> Result<bool> {
    match storage.file_type(path).await? {
        Some(FileType::Directory) => storage.rmdir(path).await,
        Some(FileType::File) => storage.unlink(path).await,
        None => Ok(false),
    }
}

pub async fn rename<S: Storage + ?Sized>(storage: &S, source: &str, target: &str) -> Result<bool> {
    storage.remove(target).await?;
    storage.remove_cached_file(source);
    Ok(storage.copy(source, target).await? && storage.remove(source).await?)
}

/// Recursive copy inside one storage.
///
/// A failed file copy logs a warning and returns `false`; classified errors
/// other than `NotFound` and `Io` propagate.
pub fn copy<'a, S: Storage + ?Sized>(
    storage: &'a S,
    source: &'a str,
    target: &'a str,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        if storage.is_dir(source).await? {
            storage.remove(target).await?;
            let listing = storage.list_directory(source).await?;
            storage.mkdir(target).await?;
            for name in listing {
                let from = path::join(source, &name);
                let to = path::join(target, &name);
                if !copy(storage, &from, &to).await? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let result = match storage.open_read(source).await {
            Ok(reader) => storage.write_stream(target, reader, None).await,
            Err(e) => Err(e),
        };
        storage.remove_cached_file(target);
        match result {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Io) => {
                warn!(source, target, error = %e, "failed to write data while copying");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    })
}

/// Generic touch: create an empty file if missing. Existing files cannot have
/// their mtime set through the primitive set, so they report `false`.
pub async fn touch<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    _mtime: Option<i64>,
) -> Result<bool> {
    if storage.file_exists(path).await? {
        return Ok(false);
    }
    storage.write_all(path, b"").await?;
    Ok(true)
}

pub async fn hash<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    algorithm: HashAlgorithm,
    raw: bool,
) -> Result<Vec<u8>> {
    let reader = storage.open_read(path).await?;
    let digest = match algorithm {
        HashAlgorithm::Md5 => digest_stream::<Md5>(reader).await?,
        HashAlgorithm::Sha1 => digest_stream::<Sha1>(reader).await?,
        HashAlgorithm::Sha256 => digest_stream::<Sha256>(reader).await?,
    };
    if raw {
        return Ok(digest);
    }
    Ok(digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .into_bytes())
}

async fn digest_stream<D: Digest + Send>(mut reader: ReadStream) -> Result<Vec<u8>> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Root probe used by availability checks.
pub async fn test<S: Storage + ?Sized>(storage: &S) -> bool {
    match storage.stat("").await {
        Ok(Some(_)) => true,
        Ok(None) => {
            info!(storage = %storage.id(), "storage root does not exist");
            false
        }
        Err(e) => {
            info!(storage = %storage.id(), error = %e, "storage test failed");
            false
        }
    }
}

pub async fn acquire_lock<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    lock_type: LockType,
    provider: &dyn LockProvider,
) -> Result<()> {
    let id = storage.id();
    let key = lock_key(&id, path);
    let readable = lock_readable(&id, path);
    let debug = storage.context().config().lock_debug;
    if debug {
        info!(%key, %readable, %lock_type, "acquire lock");
    }
    provider
        .acquire_lock(&key, lock_type, &readable)
        .await
        .map_err(|conflict| {
            if debug {
                info!(%key, %readable, existing = ?conflict.existing, "lock conflict");
            }
            StorageError::locked(path, conflict.existing)
        })
}

pub async fn release_lock<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    lock_type: LockType,
    provider: &dyn LockProvider,
) -> Result<()> {
    let id = storage.id();
    let key = lock_key(&id, path);
    if storage.context().config().lock_debug {
        info!(%key, readable = %lock_readable(&id, path), %lock_type, "release lock");
    }
    provider.release_lock(&key, lock_type).await;
    Ok(())
}

pub async fn change_lock<S: Storage + ?Sized>(
    storage: &S,
    path: &str,
    lock_type: LockType,
    provider: &dyn LockProvider,
) -> Result<()> {
    let id = storage.id();
    let key = lock_key(&id, path);
    let debug = storage.context().config().lock_debug;
    if debug {
        info!(%key, readable = %lock_readable(&id, path), %lock_type, "change lock");
    }
    provider
        .change_lock(&key, lock_type)
        .await
        .map_err(|conflict| {
            if debug {
                info!(%key, existing = ?conflict.existing, "lock conflict");
            }
            StorageError::locked(path, conflict.existing)
        })
}

//! The storage contract.
//!
//! [`Storage`] is implemented by every backend and every wrapper. A backend
//! only has to supply the primitive set (`stat`, `open_read`, `open_write`,
//! `list_directory`, `mkdir`, `rmdir`, `unlink`) plus its identity. Every
//! other operation has a default built from those primitives; the bodies live
//! in [`crate::common`] and [`crate::transfer`] so wrappers and overriding
//! backends can call them explicitly.
//!
//! All paths are storage-relative (see [`crate::path`]).

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{Cache, Propagator, Scanner, Updater, Watcher};
use crate::common;
use crate::context::StorageContext;
use crate::error::{Result, StorageError};
use crate::lock::LockProvider;
use crate::path;
use crate::stream::{ReadStream, WriteStream};
use crate::transfer;
use crate::types::{
    Availability, FileMetadata, FileType, FreeSpace, HashAlgorithm, LockType, Permissions, Stat,
    StorageKind, WriteMode,
};

/// One-shot listing of entry names in a directory.
///
/// `.` and `..` are never yielded.
#[derive(Debug)]
pub struct DirectoryListing {
    names: std::vec::IntoIter<String>,
}

impl DirectoryListing {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let names: Vec<String> = names
            .into_iter()
            .filter(|name| !path::is_ignored_dir(name))
            .collect();
        Self {
            names: names.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for DirectoryListing {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.names.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.names.size_hint()
    }
}

/// Async storage trait.
///
/// Query operations prefer `Ok(false)` / `Ok(None)` over errors for missing
/// paths; mutations report classified [`StorageError`]s.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Identity string. Two instances with the same id address the same data.
    fn id(&self) -> String;

    /// Kind of this storage (the outermost layer for wrappers).
    fn kind(&self) -> StorageKind;

    /// Whether this storage, or anything it wraps, is of `kind`.
    fn is_kind(&self, kind: StorageKind) -> bool {
        self.kind() == kind
    }

    /// Probe by type name. Legacy names are rewritten first.
    fn instance_of_storage(&self, name: &str) -> bool {
        StorageKind::from_name(name).is_some_and(|kind| self.is_kind(kind))
    }

    /// Context holding configuration and memoized handles.
    fn context(&self) -> &StorageContext;

    // ---- primitives ------------------------------------------------------

    /// Base metadata, `None` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<Option<Stat>>;

    async fn file_type(&self, path: &str) -> Result<Option<FileType>> {
        Ok(self.stat(path).await?.map(|stat| stat.file_type))
    }

    /// Open a file for reading. Missing files are `NotFound` errors.
    async fn open_read(&self, path: &str) -> Result<ReadStream>;

    /// Open a file for writing. Must be finished with `WriteStream::close`.
    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<WriteStream>;

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing>;

    async fn mkdir(&self, path: &str) -> Result<bool>;

    /// Remove a directory recursively.
    async fn rmdir(&self, path: &str) -> Result<bool>;

    /// Remove a file, or a directory via `rmdir`. Missing paths return `false`.
    async fn unlink(&self, path: &str) -> Result<bool>;

    // ---- queries ---------------------------------------------------------

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.file_type(path).await?.is_some())
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.file_type(path).await? == Some(FileType::Directory))
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(self.file_type(path).await? == Some(FileType::File))
    }

    /// Size in bytes. Directories report 0.
    async fn file_size(&self, path: &str) -> Result<u64> {
        match self.stat(path).await? {
            Some(stat) if stat.file_type.is_dir() => Ok(0),
            Some(stat) => Ok(stat.size),
            None => Err(StorageError::not_found(path)),
        }
    }

    /// Modification time in epoch seconds, 0 when unknown.
    async fn file_mtime(&self, path: &str) -> Result<i64> {
        Ok(self.stat(path).await?.map_or(0, |stat| stat.mtime.max(0)))
    }

    async fn is_readable(&self, path: &str) -> Result<bool> {
        self.file_exists(path).await
    }

    async fn is_updatable(&self, path: &str) -> Result<bool> {
        self.file_exists(path).await
    }

    async fn is_creatable(&self, path: &str) -> Result<bool> {
        Ok(self.is_dir(path).await? && self.is_updatable(path).await?)
    }

    async fn is_deletable(&self, path: &str) -> Result<bool> {
        common::is_deletable(self, path).await
    }

    async fn is_sharable(&self, path: &str) -> Result<bool> {
        self.is_readable(path).await
    }

    /// OR of the five permission checks.
    async fn permissions(&self, path: &str) -> Result<Permissions> {
        common::permissions(self, path).await
    }

    /// Metadata, or `None` when the path is not readable.
    async fn get_meta_data(&self, path: &str) -> Result<Option<FileMetadata>> {
        common::get_meta_data(self, path).await
    }

    async fn get_mime_type(&self, path: &str) -> Result<Option<String>> {
        common::get_mime_type(self, path).await
    }

    async fn free_space(&self, _path: &str) -> Result<FreeSpace> {
        Ok(FreeSpace::Unknown)
    }

    /// Change token. The default changes on every call.
    async fn get_etag(&self, _path: &str) -> Result<String> {
        Ok(common::random_etag())
    }

    /// Digest of the file content: raw bytes when `raw`, lowercase hex otherwise.
    async fn hash(&self, path: &str, algorithm: HashAlgorithm, raw: bool) -> Result<Vec<u8>> {
        common::hash(self, path, algorithm, raw).await
    }

    async fn get_owner(&self, _path: &str) -> Result<Option<String>> {
        Ok(self.context().owner())
    }

    /// Whether `path` changed after `since`. Storages without reliable
    /// mtimes must override this to return `false`.
    async fn has_updated(&self, path: &str, since: i64) -> Result<bool> {
        Ok(self.file_mtime(path).await? > since)
    }

    async fn get_direct_download(&self, _path: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Case-insensitive basename search below the root.
    async fn search(&self, query: &str) -> Result<Vec<String>> {
        common::search(self, query).await
    }

    /// Metadata of every visible entry in `path`. Entries that are not
    /// readable or are forbidden are skipped.
    fn directory_contents<'a>(&'a self, path: &'a str) -> BoxStream<'a, Result<FileMetadata>> {
        common::directory_contents(self, path)
    }

    // ---- content ---------------------------------------------------------

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        common::read_all(self, path).await
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<u64> {
        common::write_all(self, path, data).await
    }

    /// Write a stream to `path`. An incomplete copy is an `Io` error even if
    /// some bytes were written.
    async fn write_stream(
        &self,
        path: &str,
        stream: ReadStream,
        size: Option<u64>,
    ) -> Result<u64> {
        common::write_stream(self, path, stream, size).await
    }

    // ---- mutations -------------------------------------------------------

    async fn remove(&self, path: &str) -> Result<bool> {
        common::remove(self, path).await
    }

    /// Not atomic by default: remove target, copy, remove source.
    async fn rename(&self, source: &str, target: &str) -> Result<bool> {
        common::rename(self, source, target).await
    }

    async fn copy(&self, source: &str, target: &str) -> Result<bool> {
        common::copy(self, source, target).await
    }

    /// Set the mtime (now when `None`) or create an empty file.
    async fn touch(&self, path: &str, mtime: Option<i64>) -> Result<bool> {
        common::touch(self, path, mtime).await
    }

    async fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
        preserve_mtime: bool,
    ) -> Result<bool> {
        transfer::copy_from_storage(self, source, source_path, target_path, preserve_mtime).await
    }

    async fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<bool> {
        transfer::move_from_storage(self, source, source_path, target_path).await
    }

    // ---- locking ---------------------------------------------------------

    async fn acquire_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        common::acquire_lock(self, path, lock_type, provider).await
    }

    async fn release_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        common::release_lock(self, path, lock_type, provider).await
    }

    async fn change_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        common::change_lock(self, path, lock_type, provider).await
    }

    // ---- validation and availability ----------------------------------------

    fn verify_path(&self, path: &str, file_name: &str) -> Result<()> {
        self.context().validator().verify_path(path, file_name)
    }

    fn get_availability(&self) -> Availability {
        self.context().availability()
    }

    fn set_availability(&self, available: bool) {
        self.context().set_availability(available)
    }

    /// Connectivity probe.
    async fn test(&self) -> bool {
        common::test(self).await
    }

    // ---- unwrapping ------------------------------------------------------

    /// The storage one layer down, for wrappers.
    fn wrapped_storage(&self) -> Option<Arc<dyn Storage>> {
        None
    }

    /// Translate a path into the wrapped storage's namespace.
    fn unwrapped_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Absolute filesystem path, for storages backed by a local directory.
    async fn local_source_path(&self, _path: &str) -> Option<Result<PathBuf>> {
        None
    }

    // ---- cache boundary --------------------------------------------------

    fn cache(&self) -> Arc<Cache> {
        self.context().cache()
    }

    fn scanner(&self) -> Arc<Scanner> {
        self.context().scanner()
    }

    fn watcher(&self) -> Arc<Watcher> {
        self.context().watcher()
    }

    fn propagator(&self) -> Arc<Propagator> {
        self.context().propagator()
    }

    fn updater(&self) -> Arc<Updater> {
        self.context().updater()
    }

    /// Invalidate the cache entry for a path whose content changed.
    fn remove_cached_file(&self, path: &str) {
        self.cache().remove(path)
    }
}

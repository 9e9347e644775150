//! Placeholder for a storage whose construction failed.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};

use crate::context::StorageContext;
use crate::error::{Result, StorageError};
use crate::lock::LockProvider;
use crate::storage::{DirectoryListing, Storage};
use crate::stream::{ReadStream, WriteStream};
use crate::types::{
    Availability, FileMetadata, FileType, FreeSpace, HashAlgorithm, LockType, Permissions, Stat,
    StorageKind, WriteMode,
};

/// Stands in for a backend that could not be built, so the mount stays
/// visible. Every operation fails with `NotAvailable` carrying the original
/// error message.
#[derive(Debug)]
pub struct FailedStorage {
    message: String,
    context: StorageContext,
}

impl FailedStorage {
    pub fn new(cause: &StorageError, context: StorageContext) -> Self {
        Self {
            message: cause.to_string(),
            context,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn fail<T>(&self) -> Result<T> {
        Err(StorageError::not_available(self.message.clone()))
    }
}

#[async_trait]
impl Storage for FailedStorage {
    fn id(&self) -> String {
        "failedstorage".to_string()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Failed
    }

    fn context(&self) -> &StorageContext {
        &self.context
    }

    async fn stat(&self, _path: &str) -> Result<Option<Stat>> {
        self.fail()
    }

    async fn file_type(&self, _path: &str) -> Result<Option<FileType>> {
        self.fail()
    }

    async fn open_read(&self, _path: &str) -> Result<ReadStream> {
        self.fail()
    }

    async fn open_write(&self, _path: &str, _mode: WriteMode) -> Result<WriteStream> {
        self.fail()
    }

    async fn list_directory(&self, _path: &str) -> Result<DirectoryListing> {
        self.fail()
    }

    async fn mkdir(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn rmdir(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn unlink(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn file_exists(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn is_readable(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn is_updatable(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn is_creatable(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn is_deletable(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn is_sharable(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn permissions(&self, _path: &str) -> Result<Permissions> {
        self.fail()
    }

    async fn get_meta_data(&self, _path: &str) -> Result<Option<FileMetadata>> {
        self.fail()
    }

    async fn get_mime_type(&self, _path: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn free_space(&self, _path: &str) -> Result<FreeSpace> {
        self.fail()
    }

    async fn get_etag(&self, _path: &str) -> Result<String> {
        self.fail()
    }

    async fn hash(&self, _path: &str, _algorithm: HashAlgorithm, _raw: bool) -> Result<Vec<u8>> {
        self.fail()
    }

    async fn get_owner(&self, _path: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn has_updated(&self, _path: &str, _since: i64) -> Result<bool> {
        self.fail()
    }

    async fn get_direct_download(&self, _path: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn search(&self, _query: &str) -> Result<Vec<String>> {
        self.fail()
    }

    fn directory_contents<'a>(&'a self, _path: &'a str) -> BoxStream<'a, Result<FileMetadata>> {
        Box::pin(stream::once(async move { self.fail() }))
    }

    async fn rename(&self, _source: &str, _target: &str) -> Result<bool> {
        self.fail()
    }

    async fn copy(&self, _source: &str, _target: &str) -> Result<bool> {
        self.fail()
    }

    async fn touch(&self, _path: &str, _mtime: Option<i64>) -> Result<bool> {
        self.fail()
    }

    async fn copy_from_storage(
        &self,
        _source: &dyn Storage,
        _source_path: &str,
        _target_path: &str,
        _preserve_mtime: bool,
    ) -> Result<bool> {
        self.fail()
    }

    async fn move_from_storage(
        &self,
        _source: &dyn Storage,
        _source_path: &str,
        _target_path: &str,
    ) -> Result<bool> {
        self.fail()
    }

    async fn acquire_lock(
        &self,
        _path: &str,
        _lock_type: LockType,
        _provider: &dyn LockProvider,
    ) -> Result<()> {
        self.fail()
    }

    async fn release_lock(
        &self,
        _path: &str,
        _lock_type: LockType,
        _provider: &dyn LockProvider,
    ) -> Result<()> {
        self.fail()
    }

    async fn change_lock(
        &self,
        _path: &str,
        _lock_type: LockType,
        _provider: &dyn LockProvider,
    ) -> Result<()> {
        self.fail()
    }

    fn verify_path(&self, _path: &str, _file_name: &str) -> Result<()> {
        Ok(())
    }

    fn get_availability(&self) -> Availability {
        Availability {
            available: false,
            last_checked: chrono::Utc::now().timestamp(),
        }
    }

    fn set_availability(&self, _available: bool) {}

    async fn test(&self) -> bool {
        false
    }
}

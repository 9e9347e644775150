//! Bridge from the storage contract to a flysystem-style [`Adapter`].
//!
//! Adapters offer whole-object reads and writes only, so write handles are
//! staged in a temp file and stored with one `write` call on close.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

use crate::cache::Cache;
use crate::context::StorageContext;
use crate::error::{ForbiddenReason, Result, StorageError};
use crate::path;
use crate::storage::{DirectoryListing, Storage};
use crate::stream::{
    ReadStream, WriteBack, WriteStream, read_stream_from, stage_temp_file, take_staged,
};
use crate::types::{FileType, Stat, StorageKind, WriteMode};

/// Adapter failure.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Object metadata reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterMetadata {
    pub file_type: FileType,
    pub size: u64,
    /// Epoch seconds.
    pub timestamp: i64,
}

/// One entry of [`Adapter::list_contents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEntry {
    /// Full adapter path of the entry.
    pub path: String,
    pub file_type: FileType,
}

impl AdapterEntry {
    pub fn basename(&self) -> &str {
        path::basename(&self.path)
    }
}

/// Object-store style filesystem. Paths have no leading slash.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identifier of the underlying store.
    fn id(&self) -> String;

    async fn has(&self, path: &str) -> AdapterResult<bool>;

    async fn read(&self, path: &str) -> AdapterResult<Vec<u8>>;

    /// Create or overwrite a file, creating missing parents.
    async fn write(&self, path: &str, contents: Vec<u8>) -> AdapterResult<()>;

    async fn delete(&self, path: &str) -> AdapterResult<()>;

    async fn delete_dir(&self, path: &str) -> AdapterResult<()>;

    async fn create_dir(&self, path: &str) -> AdapterResult<()>;

    async fn rename(&self, from: &str, to: &str) -> AdapterResult<()>;

    async fn copy(&self, from: &str, to: &str) -> AdapterResult<()>;

    /// Direct children of a directory.
    async fn list_contents(&self, path: &str) -> AdapterResult<Vec<AdapterEntry>>;

    async fn metadata(&self, path: &str) -> AdapterResult<AdapterMetadata>;
}

fn into_storage_error(e: AdapterError, path: &str) -> StorageError {
    match e {
        AdapterError::NotFound(_) => StorageError::not_found(path),
        AdapterError::Other(message) => StorageError::io(message),
    }
}

/// `NotFound` becomes `Ok(false)`.
fn found(result: AdapterResult<()>, path: &str) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(AdapterError::NotFound(_)) => Ok(false),
        Err(e) => Err(into_storage_error(e, path)),
    }
}

/// Storage served by an [`Adapter`], optionally below a root prefix.
pub struct FlysystemStorage {
    adapter: Arc<dyn Adapter>,
    root: String,
    context: StorageContext,
}

impl std::fmt::Debug for FlysystemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlysystemStorage")
            .field("adapter", &self.adapter.id())
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FlysystemStorage {
    pub fn new(adapter: Arc<dyn Adapter>, context: StorageContext) -> Self {
        Self {
            adapter,
            root: String::new(),
            context,
        }
    }

    /// Serve only the part of the adapter below `root`.
    pub fn with_root(mut self, root: &str) -> Result<Self> {
        self.root = path::normalize(root)?;
        Ok(self)
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Adapter path of a storage path.
    fn build_path(&self, path: &str) -> Result<String> {
        let path = path::normalize(path)?;
        Ok(path::join(&self.root, &path))
    }

    fn writeback(&self, path: String, full_path: String, temp_path: tempfile::TempPath) -> WriteBack {
        let adapter = self.adapter.clone();
        let cache: Arc<Cache> = self.cache();
        Box::new(move || {
            Box::pin(async move {
                let contents = take_staged(temp_path).await?;
                let result = adapter.write(&full_path, contents).await;
                cache.remove(&path);
                result.map_err(|e| {
                    error!(path = %path, error = %e, "failed to store staged file");
                    into_storage_error(e, &path)
                })
            })
        })
    }
}

#[async_trait]
impl Storage for FlysystemStorage {
    fn id(&self) -> String {
        format!("flysystem::{}", self.adapter.id())
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Flysystem
    }

    fn context(&self) -> &StorageContext {
        &self.context
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        let full_path = self.build_path(path)?;
        match self.adapter.metadata(&full_path).await {
            Ok(meta) => Ok(Some(Stat {
                file_type: meta.file_type,
                size: if meta.file_type.is_dir() { 0 } else { meta.size },
                mtime: meta.timestamp,
                full_path: None,
            })),
            Err(AdapterError::NotFound(_)) if path::normalize(path)?.is_empty() => Ok(Some(Stat {
                file_type: FileType::Directory,
                size: 0,
                mtime: 0,
                full_path: None,
            })),
            Err(AdapterError::NotFound(_)) => Ok(None),
            Err(e) => Err(into_storage_error(e, path)),
        }
    }

    async fn file_type(&self, path: &str) -> Result<Option<FileType>> {
        if matches!(path, "" | "/" | ".") {
            return Ok(Some(FileType::Directory));
        }
        let full_path = self.build_path(path)?;
        match self.adapter.metadata(&full_path).await {
            Ok(meta) => Ok(Some(meta.file_type)),
            Err(AdapterError::NotFound(_)) => Ok(None),
            Err(e) => Err(into_storage_error(e, path)),
        }
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let full_path = self.build_path(path)?;
        if full_path == self.root {
            return Ok(true);
        }
        self.adapter
            .has(&full_path)
            .await
            .map_err(|e| into_storage_error(e, path))
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        let full_path = self.build_path(path)?;
        let contents = self
            .adapter
            .read(&full_path)
            .await
            .map_err(|e| into_storage_error(e, path))?;
        Ok(read_stream_from(contents))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let path = path::normalize(path)?;
        let full_path = self.build_path(&path)?;
        let exists = self.file_exists(&path).await?;
        let allowed = if exists {
            self.is_updatable(&path).await?
        } else {
            self.is_creatable(path::dirname(&path)).await?
        };
        if !allowed {
            return Err(StorageError::forbidden(path, ForbiddenReason::PermissionDenied));
        }
        let seed = if mode == WriteMode::Append && exists {
            Some(self.open_read(&path).await?)
        } else {
            None
        };
        let (file, temp_path) = stage_temp_file(seed).await?;
        let writeback = self.writeback(path.clone(), full_path, temp_path);
        Ok(WriteStream::with_writeback(path, file, writeback))
    }

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let full_path = self.build_path(path)?;
        match self.adapter.list_contents(&full_path).await {
            Ok(entries) => Ok(DirectoryListing::new(
                entries.iter().map(|entry| entry.basename().to_string()),
            )),
            Err(AdapterError::NotFound(_)) => Ok(DirectoryListing::empty()),
            Err(e) => Err(into_storage_error(e, path)),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<bool> {
        if self.file_exists(path).await? {
            return Ok(false);
        }
        let full_path = self.build_path(path)?;
        self.adapter
            .create_dir(&full_path)
            .await
            .map_err(|e| into_storage_error(e, path))?;
        Ok(true)
    }

    async fn rmdir(&self, path: &str) -> Result<bool> {
        let full_path = self.build_path(path)?;
        let removed = found(self.adapter.delete_dir(&full_path).await, path)?;
        self.remove_cached_file(path);
        Ok(removed)
    }

    async fn unlink(&self, path: &str) -> Result<bool> {
        if self.is_dir(path).await? {
            return self.rmdir(path).await;
        }
        let full_path = self.build_path(path)?;
        let removed = found(self.adapter.delete(&full_path).await, path)?;
        self.remove_cached_file(path);
        Ok(removed)
    }

    async fn rename(&self, source: &str, target: &str) -> Result<bool> {
        if self.file_exists(target).await? {
            self.unlink(target).await?;
        }
        let from = self.build_path(source)?;
        let to = self.build_path(target)?;
        let renamed = found(self.adapter.rename(&from, &to).await, source)?;
        if renamed {
            self.remove_cached_file(source);
            self.remove_cached_file(target);
        }
        Ok(renamed)
    }

    async fn copy(&self, source: &str, target: &str) -> Result<bool> {
        if self.file_exists(target).await? {
            self.unlink(target).await?;
        }
        let from = self.build_path(source)?;
        let to = self.build_path(target)?;
        let copied = found(self.adapter.copy(&from, &to).await, source)?;
        if copied {
            self.remove_cached_file(target);
        }
        Ok(copied)
    }

    async fn touch(&self, path: &str, _mtime: Option<i64>) -> Result<bool> {
        if self.file_exists(path).await? {
            return Ok(false);
        }
        self.write_all(path, b"").await?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::MemoryAdapter;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn storage() -> FlysystemStorage {
        FlysystemStorage::new(Arc::new(MemoryAdapter::new("mem")), StorageContext::default())
    }

    #[tokio::test]
    async fn test_identity_and_root_type() {
        let storage = storage();
        assert_eq!(storage.id(), "flysystem::mem");
        for root in ["", "/", "."] {
            assert_eq!(storage.file_type(root).await.unwrap(), Some(FileType::Directory));
        }
        assert!(storage.is_dir("").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_is_staged_until_close() {
        use tokio::io::AsyncWriteExt;

        let storage = storage();
        let mut writer = storage.open_write("a.txt", WriteMode::Truncate).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        assert!(!storage.file_exists("a.txt").await.unwrap());
        writer.close().await.unwrap();
        assert_eq!(storage.read_all("a.txt").await.unwrap(), b"hello");

        let mut writer = storage.open_write("a.txt", WriteMode::Append).await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(storage.read_all("a.txt").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_missing_paths_are_false_or_empty() {
        let storage = storage();
        assert!(!storage.unlink("nope").await.unwrap());
        assert!(!storage.rmdir("nope").await.unwrap());
        assert!(!storage.rename("nope", "other").await.unwrap());
        assert!(!storage.copy("nope", "other").await.unwrap());
        assert_eq!(storage.list_directory("nope").await.unwrap().count(), 0);
        let err = storage.open_read("nope").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rename_and_copy_replace_target() {
        let storage = storage();
        storage.write_all("a", b"new").await.unwrap();
        storage.write_all("b", b"old").await.unwrap();
        assert!(storage.copy("a", "b").await.unwrap());
        assert_eq!(storage.read_all("b").await.unwrap(), b"new");

        storage.write_all("c", b"other").await.unwrap();
        assert!(storage.rename("c", "a").await.unwrap());
        assert_eq!(storage.read_all("a").await.unwrap(), b"other");
        assert!(!storage.file_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_mkdir_touch_and_listing() {
        let storage = storage();
        assert!(storage.mkdir("dir").await.unwrap());
        assert!(!storage.mkdir("dir").await.unwrap());
        assert!(storage.touch("dir/x", None).await.unwrap());
        assert!(!storage.touch("dir/x", None).await.unwrap());
        assert_eq!(storage.file_size("dir").await.unwrap(), 0);
        assert_eq!(storage.file_size("dir/x").await.unwrap(), 0);
        let mut names: Vec<_> = storage.list_directory("dir").await.unwrap().collect();
        names.sort();
        assert_eq!(names, vec!["x"]);
        assert!(storage.unlink("dir").await.unwrap());
        assert!(!storage.file_exists("dir/x").await.unwrap());
    }

    /// Object store without directory markers: `has` only sees files.
    struct ImplicitDirs(MemoryAdapter);

    #[async_trait]
    impl Adapter for ImplicitDirs {
        fn id(&self) -> String {
            self.0.id()
        }

        async fn has(&self, path: &str) -> AdapterResult<bool> {
            match self.0.metadata(path).await {
                Ok(meta) => Ok(meta.file_type == FileType::File),
                Err(AdapterError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }

        async fn read(&self, path: &str) -> AdapterResult<Vec<u8>> {
            self.0.read(path).await
        }

        async fn write(&self, path: &str, contents: Vec<u8>) -> AdapterResult<()> {
            self.0.write(path, contents).await
        }

        async fn delete(&self, path: &str) -> AdapterResult<()> {
            self.0.delete(path).await
        }

        async fn delete_dir(&self, path: &str) -> AdapterResult<()> {
            self.0.delete_dir(path).await
        }

        async fn create_dir(&self, path: &str) -> AdapterResult<()> {
            self.0.create_dir(path).await
        }

        async fn rename(&self, from: &str, to: &str) -> AdapterResult<()> {
            self.0.rename(from, to).await
        }

        async fn copy(&self, from: &str, to: &str) -> AdapterResult<()> {
            self.0.copy(from, to).await
        }

        async fn list_contents(&self, path: &str) -> AdapterResult<Vec<AdapterEntry>> {
            self.0.list_contents(path).await
        }

        async fn metadata(&self, path: &str) -> AdapterResult<AdapterMetadata> {
            self.0.metadata(path).await
        }
    }

    #[tokio::test]
    async fn test_overwrite_checks_the_file_not_the_parent() {
        let adapter = MemoryAdapter::new("objects");
        adapter.write("reports/q1.csv", b"old".to_vec()).await.unwrap();
        let storage =
            FlysystemStorage::new(Arc::new(ImplicitDirs(adapter)), StorageContext::default());
        assert!(!storage.is_creatable("reports").await.unwrap());
        assert!(storage.is_updatable("reports/q1.csv").await.unwrap());

        storage.write_all("reports/q1.csv", b"new").await.unwrap();
        assert_eq!(storage.read_all("reports/q1.csv").await.unwrap(), b"new");

        let err = storage
            .open_write("reports/q2.csv", WriteMode::Truncate)
            .await
            .err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_root_prefix() {
        let adapter = Arc::new(MemoryAdapter::new("mem"));
        let storage = FlysystemStorage::new(adapter.clone(), StorageContext::default())
            .with_root("tenant")
            .unwrap();
        storage.write_all("f", b"x").await.unwrap();
        assert!(adapter.has("tenant/f").await.unwrap());
        assert!(storage.file_exists("").await.unwrap());
    }
}

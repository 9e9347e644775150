//! Storage decorators.
//!
//! [`Wrapper`] implements [`Storage`] by forwarding every call to the storage
//! it wraps. What a particular wrapper adds is described by a [`Layer`]:
//!
//! - path translation into the wrapped namespace and back
//! - a permission mask applied to checks, metadata and mutations
//! - a guard run before each call
//! - an observer for errors coming back up
//!
//! The wrapped storage's identity, context and cache handles are shared, so
//! locks taken through a wrapper contend with locks taken on the backend.

mod availability;
mod jail;
mod permissions_mask;

pub use availability::{AvailabilityLayer, AvailabilityWrapper};
pub use jail::{Jail, JailLayer};
pub use permissions_mask::{MaskLayer, PermissionsMask};

use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::StorageContext;
use crate::error::{ForbiddenReason, Result, StorageError};
use crate::lock::LockProvider;
use crate::path;
use crate::storage::{DirectoryListing, Storage};
use crate::stream::{ReadStream, WriteStream};
use crate::transfer::same_instance;
use crate::types::{
    FileMetadata, FileType, FreeSpace, HashAlgorithm, LockType, Permissions, Stat, StorageKind,
    WriteMode,
};

/// Behaviour a [`Wrapper`] adds on top of plain forwarding.
#[async_trait]
pub trait Layer: Send + Sync + 'static {
    fn kind(&self) -> StorageKind;

    /// Map a cleaned path into the wrapped storage's namespace.
    fn unwrap_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Map a wrapped-storage path back. `None` when it is not visible
    /// through this layer.
    fn wrap_path(&self, path: &str) -> Option<String> {
        Some(path.to_string())
    }

    /// Permissions this layer lets through.
    fn mask(&self) -> Permissions {
        Permissions::ALL
    }

    /// Runs before every forwarded call.
    async fn guard(&self, _inner: &dyn Storage) -> Result<()> {
        Ok(())
    }

    /// Sees every error returned by the wrapped storage.
    fn observe(&self, _inner: &dyn Storage, _error: &StorageError) {}
}

/// A storage wrapped by a [`Layer`].
pub struct Wrapper<L: Layer> {
    inner: Arc<dyn Storage>,
    layer: L,
}

impl<L: Layer> std::fmt::Debug for Wrapper<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapper")
            .field("kind", &self.layer.kind())
            .field("inner", &self.inner.id())
            .finish()
    }
}

impl<L: Layer> Wrapper<L> {
    pub fn new(inner: Arc<dyn Storage>, layer: L) -> Self {
        Self { inner, layer }
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    fn path(&self, path: &str) -> Result<String> {
        Ok(self.layer.unwrap_path(&path::normalize(path)?))
    }

    fn allows(&self, permission: Permissions) -> bool {
        self.layer.mask().contains(permission)
    }

    /// Guard, forward, observe.
    async fn run<T: Send>(&self, op: impl Future<Output = Result<T>> + Send) -> Result<T> {
        self.layer.guard(self.inner.as_ref()).await?;
        let result = op.await;
        if let Err(e) = &result {
            self.layer.observe(self.inner.as_ref(), e);
        }
        result
    }

    /// UPDATE for existing paths, CREATE for new ones.
    async fn write_permission(&self, inner_path: &str) -> Result<Permissions> {
        if self.inner.file_exists(inner_path).await? {
            Ok(Permissions::UPDATE)
        } else {
            Ok(Permissions::CREATE)
        }
    }

    async fn check_write(&self, path: &str, inner_path: &str) -> Result<()> {
        if self.layer.mask() == Permissions::ALL {
            return Ok(());
        }
        if self.allows(self.write_permission(inner_path).await?) {
            Ok(())
        } else {
            Err(StorageError::forbidden(path, ForbiddenReason::PermissionDenied))
        }
    }

    async fn masked_check(
        &self,
        permission: Permissions,
        op: impl Future<Output = Result<bool>> + Send,
    ) -> Result<bool> {
        if !self.allows(permission) {
            return Ok(false);
        }
        self.run(op).await
    }
}

#[async_trait]
impl<L: Layer> Storage for Wrapper<L> {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn kind(&self) -> StorageKind {
        self.layer.kind()
    }

    fn is_kind(&self, kind: StorageKind) -> bool {
        kind == StorageKind::Wrapper || self.layer.kind() == kind || self.inner.is_kind(kind)
    }

    fn context(&self) -> &StorageContext {
        self.inner.context()
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        let p = self.path(path)?;
        self.run(self.inner.stat(&p)).await
    }

    async fn file_type(&self, path: &str) -> Result<Option<FileType>> {
        let p = self.path(path)?;
        self.run(self.inner.file_type(&p)).await
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        let p = self.path(path)?;
        self.run(self.inner.open_read(&p)).await
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let p = self.path(path)?;
        self.check_write(path, &p).await?;
        self.run(self.inner.open_write(&p, mode)).await
    }

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let p = self.path(path)?;
        self.run(self.inner.list_directory(&p)).await
    }

    async fn mkdir(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::CREATE, self.inner.mkdir(&p)).await
    }

    async fn rmdir(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::DELETE, self.inner.rmdir(&p)).await
    }

    async fn unlink(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::DELETE, self.inner.unlink(&p)).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.run(self.inner.file_exists(&p)).await
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.run(self.inner.is_dir(&p)).await
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.run(self.inner.is_file(&p)).await
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        let p = self.path(path)?;
        self.run(self.inner.file_size(&p)).await
    }

    async fn file_mtime(&self, path: &str) -> Result<i64> {
        let p = self.path(path)?;
        self.run(self.inner.file_mtime(&p)).await
    }

    async fn is_readable(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::READ, self.inner.is_readable(&p))
            .await
    }

    async fn is_updatable(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::UPDATE, self.inner.is_updatable(&p))
            .await
    }

    async fn is_creatable(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::CREATE, self.inner.is_creatable(&p))
            .await
    }

    async fn is_deletable(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::DELETE, self.inner.is_deletable(&p))
            .await
    }

    async fn is_sharable(&self, path: &str) -> Result<bool> {
        let p = self.path(path)?;
        self.masked_check(Permissions::SHARE, self.inner.is_sharable(&p))
            .await
    }

    async fn permissions(&self, path: &str) -> Result<Permissions> {
        let p = self.path(path)?;
        Ok(self.run(self.inner.permissions(&p)).await? & self.layer.mask())
    }

    async fn get_meta_data(&self, path: &str) -> Result<Option<FileMetadata>> {
        let p = self.path(path)?;
        let mask = self.layer.mask();
        Ok(self.run(self.inner.get_meta_data(&p)).await?.map(|mut meta| {
            meta.permissions = meta.permissions & mask;
            meta
        }))
    }

    async fn get_mime_type(&self, path: &str) -> Result<Option<String>> {
        let p = self.path(path)?;
        self.run(self.inner.get_mime_type(&p)).await
    }

    async fn free_space(&self, path: &str) -> Result<FreeSpace> {
        let p = self.path(path)?;
        self.run(self.inner.free_space(&p)).await
    }

    async fn get_etag(&self, path: &str) -> Result<String> {
        let p = self.path(path)?;
        self.run(self.inner.get_etag(&p)).await
    }

    async fn hash(&self, path: &str, algorithm: HashAlgorithm, raw: bool) -> Result<Vec<u8>> {
        let p = self.path(path)?;
        self.run(self.inner.hash(&p, algorithm, raw)).await
    }

    async fn get_owner(&self, path: &str) -> Result<Option<String>> {
        let p = self.path(path)?;
        self.run(self.inner.get_owner(&p)).await
    }

    async fn has_updated(&self, path: &str, since: i64) -> Result<bool> {
        let p = self.path(path)?;
        self.run(self.inner.has_updated(&p, since)).await
    }

    async fn get_direct_download(&self, path: &str) -> Result<Option<String>> {
        let p = self.path(path)?;
        self.run(self.inner.get_direct_download(&p)).await
    }

    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let found = self.run(self.inner.search(query)).await?;
        Ok(found
            .iter()
            .filter_map(|path| self.layer.wrap_path(path))
            .filter(|path| !path.is_empty())
            .collect())
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>> {
        let p = self.path(path)?;
        self.run(self.inner.read_all(&p)).await
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<u64> {
        let p = self.path(path)?;
        self.check_write(path, &p).await?;
        self.run(self.inner.write_all(&p, data)).await
    }

    async fn write_stream(
        &self,
        path: &str,
        stream: ReadStream,
        size: Option<u64>,
    ) -> Result<u64> {
        let p = self.path(path)?;
        self.check_write(path, &p).await?;
        self.run(self.inner.write_stream(&p, stream, size)).await
    }

    async fn rename(&self, source: &str, target: &str) -> Result<bool> {
        let from = self.path(source)?;
        let to = self.path(target)?;
        self.masked_check(Permissions::UPDATE, self.inner.rename(&from, &to))
            .await
    }

    async fn copy(&self, source: &str, target: &str) -> Result<bool> {
        let from = self.path(source)?;
        let to = self.path(target)?;
        self.masked_check(Permissions::UPDATE, self.inner.copy(&from, &to))
            .await
    }

    async fn touch(&self, path: &str, mtime: Option<i64>) -> Result<bool> {
        let p = self.path(path)?;
        let needed = if self.layer.mask() == Permissions::ALL {
            Permissions::ALL
        } else {
            self.write_permission(&p).await?
        };
        self.masked_check(needed, self.inner.touch(&p, mtime)).await
    }

    async fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
        preserve_mtime: bool,
    ) -> Result<bool> {
        if same_instance(self, source) {
            return self.copy(source_path, target_path).await;
        }
        let p = self.path(target_path)?;
        self.masked_check(
            Permissions::CREATE,
            self.inner
                .copy_from_storage(source, source_path, &p, preserve_mtime),
        )
        .await
    }

    async fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<bool> {
        if same_instance(self, source) {
            return self.rename(source_path, target_path).await;
        }
        let p = self.path(target_path)?;
        self.masked_check(
            Permissions::CREATE,
            self.inner.move_from_storage(source, source_path, &p),
        )
        .await
    }

    async fn acquire_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        let p = self.path(path)?;
        self.inner.acquire_lock(&p, lock_type, provider).await
    }

    async fn release_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        let p = self.path(path)?;
        self.inner.release_lock(&p, lock_type, provider).await
    }

    async fn change_lock(
        &self,
        path: &str,
        lock_type: LockType,
        provider: &dyn LockProvider,
    ) -> Result<()> {
        let p = self.path(path)?;
        self.inner.change_lock(&p, lock_type, provider).await
    }

    fn verify_path(&self, path: &str, file_name: &str) -> Result<()> {
        let p = self.path(path)?;
        self.inner.verify_path(&p, file_name)
    }

    async fn test(&self) -> bool {
        self.inner.test().await
    }

    fn wrapped_storage(&self) -> Option<Arc<dyn Storage>> {
        Some(self.inner.clone())
    }

    fn unwrapped_path(&self, path: &str) -> String {
        match path::normalize(path) {
            Ok(clean) => self.layer.unwrap_path(&clean),
            Err(_) => self.layer.unwrap_path(path.trim_matches('/')),
        }
    }

    async fn local_source_path(&self, path: &str) -> Option<Result<PathBuf>> {
        match self.path(path) {
            Ok(p) => self.inner.local_source_path(&p).await,
            Err(e) => Some(Err(e)),
        }
    }

    fn remove_cached_file(&self, path: &str) {
        self.inner.remove_cached_file(&self.unwrapped_path(path))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::{FlysystemStorage, MemoryAdapter};
    use crate::transfer::unwrap_storage;

    struct Plain;

    impl Layer for Plain {
        fn kind(&self) -> StorageKind {
            StorageKind::Wrapper
        }
    }

    fn memory() -> Arc<dyn Storage> {
        Arc::new(FlysystemStorage::new(
            Arc::new(MemoryAdapter::new("m")),
            StorageContext::default(),
        ))
    }

    #[tokio::test]
    async fn test_forwards_identity_and_kind() {
        let inner = memory();
        let wrapper = Wrapper::new(inner.clone(), Plain);
        assert_eq!(wrapper.id(), inner.id());
        assert!(wrapper.is_kind(StorageKind::Wrapper));
        assert!(wrapper.is_kind(StorageKind::Flysystem));
        assert!(!wrapper.is_kind(StorageKind::Local));
        assert!(wrapper.instance_of_storage("flysystem"));
    }

    #[tokio::test]
    async fn test_unwrap_reaches_backend() {
        let inner = memory();
        let outer: Arc<dyn Storage> = Arc::new(Wrapper::new(
            Arc::new(Wrapper::new(inner.clone(), Plain)),
            Plain,
        ));
        let (innermost, path) = unwrap_storage(outer.as_ref(), "a/b");
        assert!(same_instance(inner.as_ref(), &*innermost));
        assert_eq!(path, "a/b");
    }

    #[tokio::test]
    async fn test_round_trip_through_wrapper() {
        let wrapper = Wrapper::new(memory(), Plain);
        wrapper.write_all("f.txt", b"data").await.unwrap();
        assert_eq!(wrapper.read_all("f.txt").await.unwrap(), b"data");
        assert_eq!(wrapper.file_size("f.txt").await.unwrap(), 4);
        assert!(wrapper.unlink("f.txt").await.unwrap());
        assert!(!wrapper.unlink("f.txt").await.unwrap());
    }
}

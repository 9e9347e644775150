//! Restrict what callers may do through a storage.

use std::sync::Arc;

use super::{Layer, Wrapper};
use crate::storage::Storage;
use crate::types::{Permissions, StorageKind};

/// Storage with a permission mask ANDed onto everything it reports.
///
/// Mutations the mask forbids return `false`; write handles and whole-file
/// writes fail with `Forbidden(PermissionDenied)`.
pub type PermissionsMask = Wrapper<MaskLayer>;

#[derive(Debug, Clone, Copy)]
pub struct MaskLayer {
    mask: Permissions,
}

impl MaskLayer {
    pub fn new(mask: Permissions) -> Self {
        Self { mask }
    }
}

impl Layer for MaskLayer {
    fn kind(&self) -> StorageKind {
        StorageKind::PermissionsMask
    }

    fn mask(&self) -> Permissions {
        self.mask
    }
}

impl PermissionsMask {
    pub fn masked(inner: Arc<dyn Storage>, mask: Permissions) -> Self {
        Wrapper::new(inner, MaskLayer::new(mask))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::{FlysystemStorage, MemoryAdapter};
    use crate::context::StorageContext;
    use crate::error::ErrorKind;
    use crate::types::WriteMode;
    use pretty_assertions::assert_eq;

    async fn setup(mask: Permissions) -> (Arc<dyn Storage>, PermissionsMask) {
        let inner: Arc<dyn Storage> = Arc::new(FlysystemStorage::new(
            Arc::new(MemoryAdapter::new("m")),
            StorageContext::default(),
        ));
        inner.write_all("existing.txt", b"data").await.unwrap();
        inner.mkdir("dir").await.unwrap();
        let masked = PermissionsMask::masked(inner.clone(), mask);
        (inner, masked)
    }

    #[tokio::test]
    async fn test_read_only_mask() {
        let (inner, masked) = setup(Permissions::READ).await;
        assert_eq!(masked.read_all("existing.txt").await.unwrap(), b"data");
        assert!(!masked.unlink("existing.txt").await.unwrap());
        assert!(!masked.mkdir("new").await.unwrap());
        assert!(!masked.rename("existing.txt", "moved.txt").await.unwrap());
        assert!(inner.file_exists("existing.txt").await.unwrap());

        let err = masked.write_all("existing.txt", b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = masked
            .open_write("fresh.txt", WriteMode::Truncate)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(!inner.file_exists("fresh.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_mask_composes_with_permissions() {
        let (_, masked) = setup(Permissions::READ | Permissions::CREATE).await;
        let permissions = masked.permissions("dir").await.unwrap();
        assert_eq!(permissions, Permissions::READ | Permissions::CREATE);
        assert!(masked.is_creatable("dir").await.unwrap());
        assert!(!masked.is_updatable("dir").await.unwrap());
        assert!(!masked.is_deletable("dir").await.unwrap());

        let meta = masked.get_meta_data("existing.txt").await.unwrap().unwrap();
        assert_eq!(meta.permissions, Permissions::READ);
    }

    #[tokio::test]
    async fn test_create_allowed_but_not_update() {
        let (_, masked) = setup(Permissions::READ | Permissions::CREATE).await;
        masked.write_all("dir/new.txt", b"n").await.unwrap();
        let err = masked.write_all("existing.txt", b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(masked.is_kind(StorageKind::PermissionsMask));
        assert!(masked.is_kind(StorageKind::Flysystem));
    }
}

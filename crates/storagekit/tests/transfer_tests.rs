//! Cross-storage copy and move
//!
//! Covers streaming between different backends, failure cleanup, and the
//! same-instance shortcut taken when two wrappers share one backend.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use storagekit::{
    Adapter, AdapterEntry, AdapterError, AdapterMetadata, CacheEntry, ErrorKind,
    FlysystemStorage, Jail, LocalStorage, MemoryAdapter, Permissions, PermissionsMask, Storage,
    StorageContext,
};

fn memory(id: &str) -> Arc<dyn Storage> {
    Arc::new(FlysystemStorage::new(
        Arc::new(MemoryAdapter::new(id)),
        StorageContext::default(),
    ))
}

fn binary_payload() -> Vec<u8> {
    (0..=255u8).cycle().take(256 * 257).collect()
}

/// Adapter that counts calls. Writes to poisoned paths store half the
/// content and then fail, like a disk filling up mid-upload.
struct InstrumentedAdapter {
    inner: MemoryAdapter,
    writes: AtomicUsize,
    renames: AtomicUsize,
    copies: AtomicUsize,
    poison: Option<&'static str>,
}

impl InstrumentedAdapter {
    fn new() -> Self {
        Self {
            inner: MemoryAdapter::new("instrumented"),
            writes: AtomicUsize::new(0),
            renames: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            poison: None,
        }
    }

    fn poisoned(marker: &'static str) -> Self {
        Self {
            poison: Some(marker),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Adapter for InstrumentedAdapter {
    fn id(&self) -> String {
        self.inner.id()
    }

    async fn has(&self, path: &str) -> Result<bool, AdapterError> {
        self.inner.has(path).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, contents: Vec<u8>) -> Result<(), AdapterError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.poison.is_some_and(|marker| path.contains(marker)) {
            let partial = contents[..contents.len() / 2].to_vec();
            self.inner.write(path, partial).await?;
            return Err(AdapterError::Other(format!("disk full writing {}", path)));
        }
        self.inner.write(path, contents).await
    }

    async fn delete(&self, path: &str) -> Result<(), AdapterError> {
        self.inner.delete(path).await
    }

    async fn delete_dir(&self, path: &str) -> Result<(), AdapterError> {
        self.inner.delete_dir(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<(), AdapterError> {
        self.inner.create_dir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), AdapterError> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.inner.rename(from, to).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), AdapterError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.inner.copy(from, to).await
    }

    async fn list_contents(&self, path: &str) -> Result<Vec<AdapterEntry>, AdapterError> {
        self.inner.list_contents(path).await
    }

    async fn metadata(&self, path: &str) -> Result<AdapterMetadata, AdapterError> {
        self.inner.metadata(path).await
    }
}

#[tokio::test]
async fn copy_between_backends_preserves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let local: Arc<dyn Storage> =
        Arc::new(LocalStorage::new(dir.path(), StorageContext::default()).unwrap());
    let remote = memory("remote");

    let payload = binary_payload();
    local.mkdir("project").await.unwrap();
    local.mkdir("project/assets").await.unwrap();
    local.write_all("project/readme.md", b"# hi").await.unwrap();
    local.write_all("project/assets/blob.bin", &payload).await.unwrap();

    assert!(
        remote
            .copy_from_storage(local.as_ref(), "project", "backup", false)
            .await
            .unwrap()
    );
    assert_eq!(remote.read_all("backup/assets/blob.bin").await.unwrap(), payload);
    assert_eq!(remote.read_all("backup/readme.md").await.unwrap(), b"# hi");
    assert!(local.file_exists("project/readme.md").await.unwrap());

    // And back again into a second local directory.
    let other = tempfile::tempdir().unwrap();
    let restored: Arc<dyn Storage> =
        Arc::new(LocalStorage::new(other.path(), StorageContext::default()).unwrap());
    assert!(
        restored
            .copy_from_storage(remote.as_ref(), "backup", "restored", true)
            .await
            .unwrap()
    );
    assert_eq!(
        restored.hash("restored/assets/blob.bin", storagekit::HashAlgorithm::Sha256, false)
            .await
            .unwrap(),
        local
            .hash("project/assets/blob.bin", storagekit::HashAlgorithm::Sha256, false)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn local_to_local_copy_keeps_content() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let source = LocalStorage::new(a.path(), StorageContext::default()).unwrap();
    let target = LocalStorage::new(b.path(), StorageContext::default()).unwrap();
    source.write_all("photo.jpg", &binary_payload()).await.unwrap();

    assert!(
        target
            .copy_from_storage(&source, "photo.jpg", "copy.jpg", true)
            .await
            .unwrap()
    );
    assert_eq!(target.read_all("copy.jpg").await.unwrap(), binary_payload());
    assert_eq!(
        target.file_mtime("copy.jpg").await.unwrap(),
        source.file_mtime("photo.jpg").await.unwrap()
    );
}

#[tokio::test]
async fn failed_move_keeps_source() {
    // Memory listings are sorted, so good.txt is copied before poison.txt fails.
    let source = memory("source");
    source.mkdir("batch").await.unwrap();
    source.write_all("batch/good.txt", b"good").await.unwrap();
    source.write_all("batch/poison.txt", b"bad content").await.unwrap();

    let target = FlysystemStorage::new(
        Arc::new(InstrumentedAdapter::poisoned("poison")),
        StorageContext::default(),
    );
    let err = target
        .move_from_storage(source.as_ref(), "batch", "archive")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    assert_eq!(source.read_all("batch/good.txt").await.unwrap(), b"good");
    assert_eq!(source.read_all("batch/poison.txt").await.unwrap(), b"bad content");

    // The copy stops at the failing file: earlier siblings stay, the partial
    // upload is removed.
    assert!(target.is_dir("archive").await.unwrap());
    assert_eq!(target.read_all("archive/good.txt").await.unwrap(), b"good");
    assert!(!target.file_exists("archive/poison.txt").await.unwrap());
    let mut names: Vec<String> = target.list_directory("archive").await.unwrap().collect();
    names.sort();
    assert_eq!(names, vec!["good.txt"]);
}

#[tokio::test]
async fn failed_file_copy_removes_partial_target() {
    let source = memory("source");
    source.write_all("upload.bin", &binary_payload()).await.unwrap();

    let target = FlysystemStorage::new(
        Arc::new(InstrumentedAdapter::poisoned("poison")),
        StorageContext::default(),
    );
    target.cache().put(CacheEntry {
        path: "poison.bin".into(),
        name: "poison.bin".into(),
        mimetype: "application/octet-stream".into(),
        mtime: 1,
        storage_mtime: 1,
        size: 3,
        etag: "stale".into(),
        permissions: Permissions::ALL,
    });

    let err = target
        .copy_from_storage(source.as_ref(), "upload.bin", "poison.bin", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(!target.file_exists("poison.bin").await.unwrap());
    assert!(!target.cache().contains("poison.bin"));
    assert!(source.file_exists("upload.bin").await.unwrap());
}

#[tokio::test]
async fn local_fast_path_refuses_blacklisted_source() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(src_dir.path().join("tree")).unwrap();
    std::fs::write(src_dir.path().join("tree/.htaccess"), b"deny").unwrap();
    std::fs::write(src_dir.path().join("tree/ok.txt"), b"ok").unwrap();
    let source = LocalStorage::new(src_dir.path(), StorageContext::default()).unwrap();
    let target = LocalStorage::new(dst_dir.path(), StorageContext::default()).unwrap();

    let err = target
        .copy_from_storage(&source, "tree", "copy", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(!dst_dir.path().join("copy").exists());

    let err = target
        .move_from_storage(&source, "tree", "moved")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(src_dir.path().join("tree/.htaccess").exists());
    assert!(src_dir.path().join("tree/ok.txt").exists());
    assert!(!dst_dir.path().join("moved").exists());

    // Same answer as the streaming path into another backend.
    let remote = memory("remote");
    let err = remote
        .copy_from_storage(&source, "tree", "copy", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn local_fast_path_keeps_blacklisted_target() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dst_dir.path().join("site")).unwrap();
    std::fs::write(dst_dir.path().join("site/.htaccess"), b"deny").unwrap();
    let source = LocalStorage::new(src_dir.path(), StorageContext::default()).unwrap();
    let target = LocalStorage::new(dst_dir.path(), StorageContext::default()).unwrap();
    source.mkdir("incoming").await.unwrap();
    source.write_all("incoming/index.html", b"<html>").await.unwrap();

    let err = target
        .move_from_storage(&source, "incoming", "site")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = target
        .copy_from_storage(&source, "incoming", "site", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(dst_dir.path().join("site/.htaccess").exists());
    assert!(source.file_exists("incoming/index.html").await.unwrap());

    // Renames inside one storage do not replace the tree either.
    target.mkdir("draft").await.unwrap();
    let err = target.rename("draft", "site").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(dst_dir.path().join("site/.htaccess").exists());
}

#[tokio::test]
async fn successful_move_removes_source() {
    let dir = tempfile::tempdir().unwrap();
    let source: Arc<dyn Storage> =
        Arc::new(LocalStorage::new(dir.path(), StorageContext::default()).unwrap());
    source.write_all("report.pdf", b"%PDF").await.unwrap();
    let target = memory("target");

    assert!(
        target
            .move_from_storage(source.as_ref(), "report.pdf", "report.pdf")
            .await
            .unwrap()
    );
    assert!(!source.file_exists("report.pdf").await.unwrap());
    assert_eq!(target.read_all("report.pdf").await.unwrap(), b"%PDF");
}

#[tokio::test]
async fn move_from_read_only_source_is_refused() {
    let source_inner = memory("source");
    source_inner.write_all("keep.txt", b"keep").await.unwrap();
    let source = PermissionsMask::masked(source_inner.clone(), Permissions::READ);
    let target = memory("target");

    assert!(
        !target
            .move_from_storage(&source, "keep.txt", "keep.txt")
            .await
            .unwrap()
    );
    assert!(source_inner.file_exists("keep.txt").await.unwrap());
    assert!(!target.file_exists("keep.txt").await.unwrap());
}

#[tokio::test]
async fn same_backend_move_is_a_rename() {
    let adapter = Arc::new(InstrumentedAdapter::new());
    let backend: Arc<dyn Storage> = Arc::new(FlysystemStorage::new(
        adapter.clone(),
        StorageContext::default(),
    ));
    backend.mkdir("alice").await.unwrap();
    backend.mkdir("bob").await.unwrap();
    backend.write_all("alice/big.iso", &binary_payload()).await.unwrap();

    let alice = Jail::jail(backend.clone(), "alice").unwrap();
    let bob = Jail::jail(backend.clone(), "bob").unwrap();
    let writes_before = adapter.writes.load(Ordering::SeqCst);

    assert!(bob.move_from_storage(&alice, "big.iso", "inbox.iso").await.unwrap());
    assert_eq!(adapter.renames.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.writes.load(Ordering::SeqCst), writes_before);
    assert!(!backend.file_exists("alice/big.iso").await.unwrap());
    assert_eq!(backend.read_all("bob/inbox.iso").await.unwrap(), binary_payload());

    assert!(bob.copy_from_storage(&bob, "inbox.iso", "dup.iso", false).await.unwrap());
    assert_eq!(adapter.copies.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.writes.load(Ordering::SeqCst), writes_before);
}

#[cfg(unix)]
#[tokio::test]
async fn same_local_move_keeps_inode() {
    use std::os::unix::fs::MetadataExt;

    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Storage> =
        Arc::new(LocalStorage::new(dir.path(), StorageContext::default()).unwrap());
    backend.mkdir("a").await.unwrap();
    backend.mkdir("b").await.unwrap();
    backend.write_all("a/file.bin", b"inode").await.unwrap();
    let before = std::fs::metadata(dir.path().join("a/file.bin")).unwrap().ino();

    let a = Jail::jail(backend.clone(), "a").unwrap();
    let b = Jail::jail(backend.clone(), "b").unwrap();
    assert!(b.move_from_storage(&a, "file.bin", "file.bin").await.unwrap());

    let after = std::fs::metadata(dir.path().join("b/file.bin")).unwrap().ino();
    assert_eq!(before, after);
    assert!(!dir.path().join("a/file.bin").exists());
}

#[tokio::test]
async fn masked_same_backend_move_requires_delete() {
    let backend = memory("shared");
    backend.mkdir("a").await.unwrap();
    backend.mkdir("b").await.unwrap();
    backend.write_all("a/locked.txt", b"x").await.unwrap();

    let source = PermissionsMask::masked(
        Arc::new(Jail::jail(backend.clone(), "a").unwrap()),
        Permissions::READ,
    );
    let target = Jail::jail(backend.clone(), "b").unwrap();
    assert!(!target.move_from_storage(&source, "locked.txt", "locked.txt").await.unwrap());
    assert!(backend.file_exists("a/locked.txt").await.unwrap());
    assert!(!backend.file_exists("b/locked.txt").await.unwrap());
}

//! WebDAV stat cache behaviour against an in-memory server
//!
//! The server counts PROPFIND requests so the tests can tell cached answers
//! from round trips.

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use storagekit::backends::dav::{CachedStat, DavMethod, DavProps, DavResponse, Depth};
use storagekit::stream::read_stream_from;
use storagekit::{
    DavConfig, DavStorage, DavTransport, ErrorKind, ReadStream, Storage, StorageContext,
    TransportError, path,
};

const MTIME: i64 = 1_700_000_000;

/// `None` marks a collection.
type Tree = BTreeMap<String, Option<Vec<u8>>>;

struct FakeServer {
    tree: Mutex<Tree>,
    propfinds: AtomicUsize,
    locked: Mutex<Option<String>>,
}

impl FakeServer {
    fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert(String::new(), None);
        Self {
            tree: Mutex::new(tree),
            propfinds: AtomicUsize::new(0),
            locked: Mutex::new(None),
        }
    }

    fn propfinds(&self) -> usize {
        self.propfinds.load(Ordering::SeqCst)
    }

    /// Change a file behind the storage's back.
    fn upload_directly(&self, path: &str, body: &[u8]) {
        self.tree
            .lock()
            .unwrap()
            .insert(path.to_string(), Some(body.to_vec()));
    }

    fn props(entry: &Option<Vec<u8>>) -> DavProps {
        match entry {
            None => DavProps {
                is_collection: true,
                last_modified: Some(MTIME),
                etag: Some("\"dir\"".into()),
                ..Default::default()
            },
            Some(body) => DavProps {
                is_collection: false,
                content_length: Some(body.len() as u64),
                last_modified: Some(MTIME),
                etag: Some(format!("\"{}\"", body.len())),
                content_type: Some("text/plain".into()),
                ..Default::default()
            },
        }
    }

    fn key(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn check_lock(&self, path: &str) -> Result<(), TransportError> {
        match self.locked.lock().unwrap().as_deref() {
            Some(locked) if locked == path => Err(TransportError::Status(423)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DavTransport for FakeServer {
    async fn propfind(&self, path: &str, depth: Depth) -> Result<Vec<DavResponse>, TransportError> {
        self.propfinds.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(path);
        let tree = self.tree.lock().unwrap();
        let Some(entry) = tree.get(&key) else {
            return Err(TransportError::Status(404));
        };
        let mut responses = vec![DavResponse {
            path: key.clone(),
            props: Self::props(entry),
        }];
        if depth == Depth::One && entry.is_none() {
            for (child, entry) in tree.iter() {
                if !child.is_empty() && child != &key && path::dirname(child) == key {
                    responses.push(DavResponse {
                        path: child.clone(),
                        props: Self::props(entry),
                    });
                }
            }
        }
        Ok(responses)
    }

    async fn get(&self, path: &str) -> Result<ReadStream, TransportError> {
        match self.tree.lock().unwrap().get(&Self::key(path)) {
            Some(Some(body)) => Ok(read_stream_from(body.clone())),
            Some(None) => Err(TransportError::Status(405)),
            None => Err(TransportError::Status(404)),
        }
    }

    async fn put(
        &self,
        path: &str,
        mut body: ReadStream,
        size: u64,
    ) -> Result<u16, TransportError> {
        let key = Self::key(path);
        self.check_lock(&key)?;
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if buf.len() as u64 != size {
            return Err(TransportError::Status(400));
        }
        let body = buf;
        let mut tree = self.tree.lock().unwrap();
        if !tree.contains_key(path::dirname(&key)) {
            return Err(TransportError::Status(409));
        }
        let status = if tree.contains_key(&key) { 204 } else { 201 };
        tree.insert(key, Some(body));
        Ok(status)
    }

    async fn send(
        &self,
        method: DavMethod,
        path: &str,
        destination: Option<&str>,
    ) -> Result<u16, TransportError> {
        let key = Self::key(path);
        self.check_lock(&key)?;
        let mut tree = self.tree.lock().unwrap();
        match method {
            DavMethod::Delete => {
                if tree.remove(&key).is_none() {
                    return Err(TransportError::Status(404));
                }
                let prefix = format!("{}/", key);
                tree.retain(|k, _| !k.starts_with(&prefix));
                Ok(204)
            }
            DavMethod::Mkcol => {
                if tree.contains_key(&key) {
                    return Err(TransportError::Status(405));
                }
                if !tree.contains_key(path::dirname(&key)) {
                    return Err(TransportError::Status(409));
                }
                tree.insert(key, None);
                Ok(201)
            }
            DavMethod::Move | DavMethod::Copy => {
                let target = Self::key(destination.unwrap_or_default());
                let Some(entry) = tree.get(&key).cloned() else {
                    return Err(TransportError::Status(404));
                };
                if method == DavMethod::Move {
                    tree.remove(&key);
                }
                tree.insert(target, entry);
                Ok(201)
            }
        }
    }

    async fn set_mtime(&self, _path: &str, _mtime: i64) -> Result<u16, TransportError> {
        Err(TransportError::Status(501))
    }
}

fn setup() -> (Arc<FakeServer>, DavStorage) {
    let server = Arc::new(FakeServer::new());
    let config = DavConfig {
        host: "https://dav.example.com".into(),
        user: "alice".into(),
        password: "secret".into(),
        root: "files".into(),
        ..Default::default()
    };
    let storage =
        DavStorage::with_transport(&config, server.clone(), StorageContext::default()).unwrap();
    (server, storage)
}

#[tokio::test]
async fn repeated_queries_hit_the_cache() {
    let (server, storage) = setup();
    assert!(!storage.file_exists("a.txt").await.unwrap());
    assert!(!storage.file_exists("a.txt").await.unwrap());
    assert!(storage.stat("a.txt").await.unwrap().is_none());
    assert_eq!(server.propfinds(), 1);
}

#[tokio::test]
async fn writes_invalidate_cached_absence() {
    let (server, storage) = setup();
    assert!(!storage.file_exists("a.txt").await.unwrap());

    storage.write_all("a.txt", b"hello").await.unwrap();
    assert!(storage.file_exists("a.txt").await.unwrap());
    assert_eq!(storage.file_size("a.txt").await.unwrap(), 5);
    assert_eq!(storage.read_all("a.txt").await.unwrap(), b"hello");

    let after_write = server.propfinds();
    assert_eq!(storage.file_size("a.txt").await.unwrap(), 5);
    assert_eq!(server.propfinds(), after_write);
}

#[tokio::test]
async fn unlink_and_rmdir_forget_subtree() {
    let (_, storage) = setup();
    assert!(storage.mkdir("docs").await.unwrap());
    storage.write_all("docs/a.txt", b"a").await.unwrap();
    assert!(storage.is_file("docs/a.txt").await.unwrap());

    assert!(storage.rmdir("docs").await.unwrap());
    assert!(!storage.file_exists("docs").await.unwrap());
    assert!(!storage.file_exists("docs/a.txt").await.unwrap());
    assert!(matches!(
        storage.stat_cache().get("docs"),
        None | Some(CachedStat::Missing)
    ));

    assert!(!storage.unlink("docs/a.txt").await.unwrap());
}

#[tokio::test]
async fn listing_primes_children() {
    let (server, storage) = setup();
    server.upload_directly("one.txt", b"1");
    server.upload_directly("two.txt", b"22");

    let mut names: Vec<String> = storage.list_directory("").await.unwrap().collect();
    names.sort();
    assert_eq!(names, vec!["one.txt", "two.txt"]);

    let before = server.propfinds();
    assert_eq!(storage.file_size("two.txt").await.unwrap(), 2);
    assert!(storage.is_file("one.txt").await.unwrap());
    assert_eq!(server.propfinds(), before);
}

#[tokio::test]
async fn rename_updates_both_ends() {
    let (_, storage) = setup();
    storage.write_all("old.txt", b"x").await.unwrap();
    assert!(storage.file_exists("old.txt").await.unwrap());
    assert!(!storage.file_exists("new.txt").await.unwrap());

    assert!(storage.rename("old.txt", "new.txt").await.unwrap());
    assert!(!storage.file_exists("old.txt").await.unwrap());
    assert!(storage.file_exists("new.txt").await.unwrap());
    assert_eq!(storage.read_all("new.txt").await.unwrap(), b"x");
}

#[tokio::test]
async fn external_changes_show_after_update_check() {
    let (server, storage) = setup();
    storage.write_all("shared.txt", b"v1").await.unwrap();
    assert_eq!(storage.file_size("shared.txt").await.unwrap(), 2);

    server.upload_directly("shared.txt", b"version two");
    assert_eq!(storage.file_size("shared.txt").await.unwrap(), 2);

    // has_updated always asks the server and refreshes the entry.
    assert!(storage.has_updated("shared.txt", 0).await.unwrap());
    assert_eq!(storage.file_size("shared.txt").await.unwrap(), 11);
}

#[tokio::test]
async fn locked_resource_is_reported() {
    let (server, storage) = setup();
    storage.write_all("busy.txt", b"x").await.unwrap();
    *server.locked.lock().unwrap() = Some("busy.txt".into());

    let err = storage.write_all("busy.txt", b"y").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Locked);
    let err = storage.unlink("busy.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Locked);
}

#[tokio::test]
async fn identity_and_touch_fallback() {
    let (_, storage) = setup();
    assert_eq!(storage.id(), "webdav::alice@dav.example.com//files/");
    storage.write_all("t.txt", b"").await.unwrap();
    assert!(!storage.touch("t.txt", Some(MTIME + 10)).await.unwrap());
    assert!(storage.touch("fresh.txt", None).await.unwrap());
    assert!(storage.file_exists("fresh.txt").await.unwrap());
}

#[tokio::test]
async fn staged_upload_streams_whole_file() {
    let (server, storage) = setup();
    let payload: Vec<u8> = (0..=255u8).cycle().take(3 * 65536 + 7).collect();
    storage.write_all("big.bin", &payload).await.unwrap();
    assert_eq!(
        server.tree.lock().unwrap().get("big.bin").cloned(),
        Some(Some(payload.clone()))
    );

    let mut writer = storage
        .open_write("big.bin", storagekit::WriteMode::Append)
        .await
        .unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut writer, b"tail").await.unwrap();
    writer.close().await.unwrap();
    assert_eq!(
        storage.file_size("big.bin").await.unwrap(),
        payload.len() as u64 + 4
    );
}

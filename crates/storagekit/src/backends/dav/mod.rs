//! WebDAV backend.
//!
//! [`DavStorage`] maps the storage contract onto WebDAV requests issued
//! through a [`DavTransport`]. The production transport is
//! [`ReqwestDavClient`]; tests plug in an in-memory one.
//!
//! A per-instance stat cache remembers what PROPFIND said about each path.
//! Mutations clear or correct the affected entries before returning.
//!
//! Writes are emulated: content is staged in a temp file and uploaded with
//! PUT when the handle is closed.

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

#[cfg(feature = "dav")]
mod client;
pub mod props;

#[cfg(feature = "dav")]
pub use client::ReqwestDavClient;
pub use props::{DavProps, DavResponse};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use percent_encoding::percent_decode_str;
use tracing::{debug, error, warn};

use crate::cache::Cache;
use crate::common;
use crate::context::StorageContext;
use crate::error::{ForbiddenReason, Result, StorageError};
use crate::logging::LogConfig;
use crate::path;
use crate::storage::{DirectoryListing, Storage};
use crate::stream::{ReadStream, WriteBack, WriteStream, open_staged, stage_temp_file};
use crate::types::{
    DIRECTORY_MIMETYPE, FileMetadata, FileType, FreeSpace, Permissions, Stat, StorageKind,
    WriteMode, mimetype_for,
};

/// HTTP 401 Unauthorized.
const STATUS_UNAUTHORIZED: u16 = 401;
const STATUS_FORBIDDEN: u16 = 403;
const STATUS_NOT_FOUND: u16 = 404;
const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
const STATUS_LOCKED: u16 = 423;
const STATUS_NOT_IMPLEMENTED: u16 = 501;

/// Failure reported by a [`DavTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// Server answered with a non-success status.
    #[error("server returned HTTP {0}")]
    Status(u16),

    /// Connection refused, reset or timed out.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Response body could not be understood (e.g. HTML instead of XML).
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// PROPFIND depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// Body-less WebDAV methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavMethod {
    Delete,
    Mkcol,
    Move,
    Copy,
}

impl DavMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DavMethod::Delete => "DELETE",
            DavMethod::Mkcol => "MKCOL",
            DavMethod::Move => "MOVE",
            DavMethod::Copy => "COPY",
        }
    }
}

/// Wire operations needed by [`DavStorage`].
///
/// Paths are storage-relative. A trailing `/` addresses a collection.
/// Non-2xx answers are reported as [`TransportError::Status`].
#[async_trait]
pub trait DavTransport: Send + Sync {
    async fn propfind(
        &self,
        path: &str,
        depth: Depth,
    ) -> std::result::Result<Vec<DavResponse>, TransportError>;

    async fn get(&self, path: &str) -> std::result::Result<ReadStream, TransportError>;

    /// PUT `size` bytes read from `body`.
    async fn put(
        &self,
        path: &str,
        body: ReadStream,
        size: u64,
    ) -> std::result::Result<u16, TransportError>;

    /// DELETE and MKCOL ignore `destination`; MOVE and COPY require it and
    /// always overwrite.
    async fn send(
        &self,
        method: DavMethod,
        path: &str,
        destination: Option<&str>,
    ) -> std::result::Result<u16, TransportError>;

    /// PROPPATCH `lastmodified`.
    async fn set_mtime(&self, path: &str, mtime: i64) -> std::result::Result<u16, TransportError>;
}

/// Connection parameters of a WebDAV mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DavConfig {
    /// Host, optionally with `http://` / `https://` and a path prefix.
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Root folder on the server.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub secure: bool,
    /// PEM bundle with extra trusted certificates.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,
}

impl DavConfig {
    /// Strip a scheme from `host` into `secure` and bring `root` into
    /// `/root/` form.
    ///
    /// Credentials embedded in the host (`user:pass@host`) fill an empty
    /// `user` / `password` and are removed from the host.
    pub fn normalized(&self) -> Result<Self> {
        let mut config = self.clone();
        if let Some(rest) = config.host.strip_prefix("https://") {
            config.host = rest.to_string();
            config.secure = true;
        } else if let Some(rest) = config.host.strip_prefix("http://") {
            config.host = rest.to_string();
            config.secure = false;
        }
        let authority_end = config.host.find('/').unwrap_or(config.host.len());
        if let Some(at) = config.host[..authority_end].rfind('@') {
            let scheme = if config.secure { "https" } else { "http" };
            let endpoint = format!("{}://{}", scheme, config.host);
            warn!(
                endpoint = %LogConfig::default().redact_url(&endpoint),
                "webdav host carries credentials, using them for basic auth"
            );
            let userinfo = config.host[..at].to_string();
            config.host = config.host[at + 1..].to_string();
            let (user, password) = match userinfo.split_once(':') {
                Some((user, password)) => (user, Some(password)),
                None => (userinfo.as_str(), None),
            };
            if config.user.is_empty() {
                config.user = percent_decode_str(user).decode_utf8_lossy().into_owned();
            }
            if let Some(password) = password.filter(|_| config.password.is_empty()) {
                config.password = percent_decode_str(password).decode_utf8_lossy().into_owned();
            }
        }
        if config.host.is_empty() || config.user.is_empty() {
            return Err(StorageError::Invalid(
                "invalid webdav storage configuration: host and user are required".into(),
            ));
        }
        config.host = config.host.trim_end_matches('/').to_string();
        let trimmed = config.root.trim_matches('/');
        config.root = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", trimmed)
        };
        Ok(config)
    }

    /// Base URI of the storage root (normalized config expected).
    pub fn base_uri(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host, self.root)
    }

    /// `webdav::<user>@<host>/<root>` (normalized config expected).
    pub fn storage_id(&self) -> String {
        format!("webdav::{}@{}/{}", self.user, self.host, self.root)
    }
}

/// What the stat cache knows about a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedStat {
    /// Known absent.
    Missing,
    /// Exists, properties not fetched.
    Exists,
    Props(DavProps),
}

/// Per-instance PROPFIND cache.
#[derive(Debug, Default)]
pub struct StatCache {
    entries: Mutex<HashMap<String, CachedStat>>,
}

impl StatCache {
    pub fn get(&self, path: &str) -> Option<CachedStat> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    pub fn set(&self, path: &str, value: CachedStat) {
        self.entries.lock().unwrap().insert(path.to_string(), value);
    }

    pub fn remove(&self, path: &str) {
        self.entries.lock().unwrap().remove(path);
    }

    /// Drop every descendant of `path`.
    pub fn clear_below(&self, path: &str) {
        let mut entries = self.entries.lock().unwrap();
        if path.is_empty() {
            entries.retain(|key, _| key.is_empty());
        } else {
            let prefix = format!("{}/", path);
            entries.retain(|key, _| !key.starts_with(&prefix));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Translate a transport failure. `None` means the failure is benign (405)
/// and the caller should report `false`.
pub fn convert_error(error: TransportError, path: &str) -> Option<StorageError> {
    debug!(path, error = %error, "webdav request failed");
    match error {
        TransportError::Status(STATUS_LOCKED) => Some(StorageError::locked(path, None)),
        TransportError::Status(STATUS_UNAUTHORIZED) => Some(StorageError::Invalid(format!(
            "authentication failed for {}",
            path
        ))),
        TransportError::Status(STATUS_METHOD_NOT_ALLOWED) => None,
        TransportError::Status(STATUS_FORBIDDEN) => Some(StorageError::forbidden(
            path,
            ForbiddenReason::PermissionDenied,
        )),
        other => Some(StorageError::not_available(other.to_string())),
    }
}

fn benign(error: TransportError, path: &str) -> Result<bool> {
    match convert_error(error, path) {
        Some(err) => Err(err),
        None => Ok(false),
    }
}

/// Storage on a WebDAV server.
pub struct DavStorage {
    id: String,
    transport: Arc<dyn DavTransport>,
    stat_cache: Arc<StatCache>,
    context: StorageContext,
}

impl std::fmt::Debug for DavStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavStorage")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl DavStorage {
    /// Connect with the reqwest transport.
    #[cfg(feature = "dav")]
    pub fn connect(config: &DavConfig, context: StorageContext) -> Result<Self> {
        let config = config.normalized()?;
        if config.password.is_empty() {
            return Err(StorageError::Invalid(
                "invalid webdav storage configuration: password is required".into(),
            ));
        }
        let timeout = std::time::Duration::from_secs(context.config().dav_timeout_secs);
        let client = ReqwestDavClient::new(&config, timeout)?;
        Self::with_transport(&config, Arc::new(client), context)
    }

    /// Use a caller-provided transport.
    pub fn with_transport(
        config: &DavConfig,
        transport: Arc<dyn DavTransport>,
        context: StorageContext,
    ) -> Result<Self> {
        let config = config.normalized()?;
        debug!(
            endpoint = %LogConfig::default().redact_url(&config.base_uri()),
            user = %config.user,
            "webdav storage configured"
        );
        Ok(Self {
            id: config.storage_id(),
            transport,
            stat_cache: Arc::new(StatCache::default()),
            context,
        })
    }

    /// The transport cache, exposed for inspection.
    pub fn stat_cache(&self) -> &StatCache {
        &self.stat_cache
    }

    fn clean(&self, path: &str) -> Result<String> {
        path::normalize(path)
    }

    /// Properties of `path`, from the cache or a Depth:0 PROPFIND.
    async fn propfind(&self, path: &str) -> Result<Option<DavProps>> {
        match self.stat_cache.get(path) {
            Some(CachedStat::Missing) => return Ok(None),
            Some(CachedStat::Props(props)) => return Ok(Some(props)),
            Some(CachedStat::Exists) | None => {}
        }
        match self.transport.propfind(path, Depth::Zero).await {
            Ok(responses) => {
                let props = responses
                    .into_iter()
                    .next()
                    .map(|response| response.props)
                    .ok_or_else(|| {
                        StorageError::not_available(format!("empty multistatus for {}", path))
                    })?;
                self.stat_cache.set(path, CachedStat::Props(props.clone()));
                Ok(Some(props))
            }
            Err(TransportError::Status(STATUS_NOT_FOUND | STATUS_METHOD_NOT_ALLOWED)) => {
                self.stat_cache.clear_below(path);
                self.stat_cache.set(path, CachedStat::Missing);
                Ok(None)
            }
            Err(e) => Err(convert_error(e, path)
                .unwrap_or_else(|| StorageError::not_available(format!("propfind {}", path)))),
        }
    }

    async fn delete(&self, path: &str, target: &str) -> Result<bool> {
        let result = match self.transport.send(DavMethod::Delete, target, None).await {
            Ok(status) => Ok(status == 204),
            Err(TransportError::Status(STATUS_NOT_FOUND)) => Ok(false),
            Err(e) => benign(e, path),
        };
        self.stat_cache.clear_below(path);
        self.stat_cache.remove(path);
        result
    }

    async fn transfer(&self, method: DavMethod, source: &str, target: &str) -> Result<bool> {
        let source = self.clean(source)?;
        let target = self.clean(target)?;
        let destination = if self.is_dir(&target).await? {
            format!("{}/", target)
        } else {
            target.clone()
        };
        if let Err(e) = self.transport.send(method, &source, Some(&destination)).await {
            return benign(e, &source);
        }
        self.stat_cache.clear_below(&target);
        self.stat_cache.set(&target, CachedStat::Exists);
        self.remove_cached_file(&target);
        if method == DavMethod::Move {
            self.stat_cache.clear_below(&source);
            self.stat_cache.set(&source, CachedStat::Missing);
            self.remove_cached_file(&source);
        }
        Ok(true)
    }

    fn writeback(&self, path: String, temp_path: tempfile::TempPath) -> WriteBack {
        let transport = self.transport.clone();
        let stat_cache = self.stat_cache.clone();
        let cache: Arc<Cache> = self.cache();
        Box::new(move || {
            Box::pin(async move {
                let (body, size) = open_staged(temp_path).await?;
                stat_cache.remove(&path);
                let result = transport.put(&path, body, size).await;
                cache.remove(&path);
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        error!(path = %path, error = %e, "failed to upload staged file");
                        Err(convert_error(e, &path)
                            .unwrap_or_else(|| StorageError::io(format!("upload of {} rejected", path))))
                    }
                }
            })
        })
    }
}

#[async_trait]
impl Storage for DavStorage {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Dav
    }

    fn context(&self) -> &StorageContext {
        &self.context
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        let path = self.clean(path)?;
        Ok(self.propfind(&path).await?.map(|props| Stat {
            file_type: props.file_type(),
            size: props.content_length.unwrap_or(0),
            mtime: props.last_modified.unwrap_or(0),
            full_path: None,
        }))
    }

    async fn file_type(&self, path: &str) -> Result<Option<FileType>> {
        let path = self.clean(path)?;
        Ok(self.propfind(&path).await?.map(|props| props.file_type()))
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let path = self.clean(path)?;
        match self.stat_cache.get(&path) {
            Some(CachedStat::Missing) => Ok(false),
            Some(_) => Ok(true),
            None => Ok(self.propfind(&path).await?.is_some()),
        }
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        let path = self.clean(path)?;
        match self.transport.get(&path).await {
            Ok(stream) => Ok(stream),
            Err(TransportError::Status(STATUS_NOT_FOUND)) => Err(StorageError::not_found(path)),
            Err(e) => Err(convert_error(e, &path).unwrap_or_else(|| StorageError::not_found(&path))),
        }
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let path = self.clean(path)?;
        let seed = if self.file_exists(&path).await? {
            if !self.is_updatable(&path).await? {
                return Err(StorageError::forbidden(path, ForbiddenReason::PermissionDenied));
            }
            match mode {
                WriteMode::Truncate => None,
                WriteMode::Append => Some(self.open_read(&path).await?),
            }
        } else {
            if !self.is_creatable(path::dirname(&path)).await? {
                return Err(StorageError::forbidden(path, ForbiddenReason::PermissionDenied));
            }
            None
        };
        let (file, temp_path) = stage_temp_file(seed).await?;
        let writeback = self.writeback(path.clone(), temp_path);
        Ok(WriteStream::with_writeback(path, file, writeback))
    }

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let path = self.clean(path)?;
        match self.transport.propfind(&path, Depth::One).await {
            Ok(responses) => {
                let mut names = Vec::new();
                for response in responses {
                    if response.path == path {
                        self.stat_cache.set(&path, CachedStat::Props(response.props));
                        continue;
                    }
                    names.push(path::basename(&response.path).to_string());
                    self.stat_cache
                        .set(&response.path, CachedStat::Props(response.props));
                }
                if self.stat_cache.get(&path).is_none() {
                    self.stat_cache.set(&path, CachedStat::Exists);
                }
                Ok(DirectoryListing::new(names))
            }
            Err(TransportError::Status(STATUS_NOT_FOUND | STATUS_METHOD_NOT_ALLOWED)) => {
                self.stat_cache.clear_below(&path);
                self.stat_cache.set(&path, CachedStat::Missing);
                Err(StorageError::not_found(path))
            }
            Err(e) => Err(convert_error(e, &path).unwrap_or_else(|| StorageError::not_found(&path))),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<bool> {
        let path = self.clean(path)?;
        match self.transport.send(DavMethod::Mkcol, &path, None).await {
            Ok(status) => {
                let created = status == 201;
                if created {
                    self.stat_cache.set(&path, CachedStat::Exists);
                }
                Ok(created)
            }
            Err(e) => benign(e, &path),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<bool> {
        let path = self.clean(path)?;
        let target = format!("{}/", path);
        self.delete(&path, &target).await
    }

    async fn unlink(&self, path: &str) -> Result<bool> {
        let path = self.clean(path)?;
        self.delete(&path, &path).await
    }

    async fn permissions(&self, path: &str) -> Result<Permissions> {
        let path = self.clean(path)?;
        Ok(self
            .propfind(&path)
            .await?
            .map_or(Permissions::NONE, |props| props.permissions()))
    }

    async fn is_updatable(&self, path: &str) -> Result<bool> {
        Ok(self.permissions(path).await?.contains(Permissions::UPDATE))
    }

    async fn is_creatable(&self, path: &str) -> Result<bool> {
        Ok(self.permissions(path).await?.contains(Permissions::CREATE))
    }

    async fn is_deletable(&self, path: &str) -> Result<bool> {
        Ok(self.permissions(path).await?.contains(Permissions::DELETE))
    }

    async fn is_sharable(&self, path: &str) -> Result<bool> {
        Ok(self.permissions(path).await?.contains(Permissions::SHARE))
    }

    async fn get_meta_data(&self, path: &str) -> Result<Option<FileMetadata>> {
        let path = self.clean(path)?;
        if self.context.validator().is_blacklisted(&path) {
            return Err(StorageError::forbidden(path, ForbiddenReason::Blacklisted));
        }
        let Some(props) = self.propfind(&path).await? else {
            return Ok(None);
        };
        let storage_mtime = props.last_modified.unwrap_or(0);
        let mimetype = if props.is_collection {
            DIRECTORY_MIMETYPE.to_string()
        } else {
            props
                .content_type
                .clone()
                .unwrap_or_else(|| mimetype_for(path::basename(&path)).to_string())
        };
        Ok(Some(FileMetadata {
            mimetype,
            mtime: if storage_mtime > 0 { storage_mtime } else { common::now() },
            storage_mtime,
            size: match props.content_length {
                Some(size) if !props.is_collection => size as i64,
                _ => -1,
            },
            etag: props.normalized_etag().unwrap_or_else(common::random_etag),
            permissions: props.permissions(),
            name: path::basename(&path).to_string(),
        }))
    }

    async fn get_mime_type(&self, path: &str) -> Result<Option<String>> {
        let path = self.clean(path)?;
        Ok(self.propfind(&path).await?.map(|props| {
            if props.is_collection {
                DIRECTORY_MIMETYPE.to_string()
            } else {
                props
                    .content_type
                    .unwrap_or_else(|| mimetype_for(path::basename(&path)).to_string())
            }
        }))
    }

    async fn free_space(&self, path: &str) -> Result<FreeSpace> {
        let path = self.clean(path)?;
        match self.propfind(&path).await {
            Ok(Some(props)) => Ok(props
                .quota_available
                .map_or(FreeSpace::Unknown, FreeSpace::from_signed)),
            Ok(None) | Err(_) => Ok(FreeSpace::Unknown),
        }
    }

    async fn get_etag(&self, path: &str) -> Result<String> {
        let path = self.clean(path)?;
        match self.propfind(&path).await? {
            Some(props) => Ok(props.normalized_etag().unwrap_or_else(common::random_etag)),
            None => Err(StorageError::not_found(path)),
        }
    }

    async fn has_updated(&self, path: &str, since: i64) -> Result<bool> {
        let path = self.clean(path)?;
        self.stat_cache.remove(&path);
        let Some(props) = self.propfind(&path).await? else {
            if path.is_empty() {
                return Err(StorageError::not_available("root is gone"));
            }
            return Ok(false);
        };

        if let Some(etag) = props.normalized_etag() {
            let Some(cached) = self.cache().get(&path) else {
                return Ok(true);
            };
            if !etag.is_empty() && cached.etag != etag {
                return Ok(true);
            }
            if let Some(share_permissions) = props.share_permissions {
                return Ok(share_permissions != cached.permissions.bits());
            }
            if let Some(raw) = &props.permissions {
                return Ok(props::parse_permissions(raw) != cached.permissions);
            }
            return Ok(false);
        }
        match props.last_modified {
            Some(mtime) => Ok(mtime > since),
            None => Ok(false),
        }
    }

    async fn rename(&self, source: &str, target: &str) -> Result<bool> {
        self.transfer(DavMethod::Move, source, target).await
    }

    async fn copy(&self, source: &str, target: &str) -> Result<bool> {
        self.transfer(DavMethod::Copy, source, target).await
    }

    async fn touch(&self, path: &str, mtime: Option<i64>) -> Result<bool> {
        let path = self.clean(path)?;
        let mtime = mtime.unwrap_or_else(common::now);
        if !self.file_exists(&path).await? {
            self.write_all(&path, b"").await?;
            return Ok(true);
        }

        self.stat_cache.remove(&path);
        match self.transport.set_mtime(&path, mtime).await {
            Ok(_) => {}
            Err(TransportError::Status(STATUS_NOT_IMPLEMENTED)) => return Ok(false),
            Err(e) => return benign(e, &path),
        }
        // Servers may accept the PROPPATCH without applying it.
        match self.transport.propfind(&path, Depth::Zero).await {
            Ok(responses) => {
                let Some(response) = responses.into_iter().next() else {
                    return Ok(true);
                };
                let accepted = response
                    .props
                    .last_modified
                    .is_none_or(|remote| remote == mtime);
                self.stat_cache.set(&path, CachedStat::Props(response.props));
                Ok(accepted)
            }
            Err(TransportError::Status(STATUS_NOT_IMPLEMENTED)) => Ok(false),
            Err(e) => benign(e, &path),
        }
    }
}

//! Local disk storage.
//!
//! [`LocalStorage`] maps storage paths onto a data directory. The flavour
//! parameter selects identity and ownership: [`Plain`] (`local::<datadir>`),
//! [`Home`] (`home::<user>`) and [`Temporary`] (a private temp dir that is
//! removed when the storage is dropped). All flavours share the same
//! filesystem behaviour.
//!
//! # Security
//!
//! Every path goes through [`LocalStorage::get_source_path`]:
//! - blacklisted names are rejected before touching the filesystem
//! - `..` above the root is rejected by [`crate::path::normalize`]
//! - unless `allow_symlinks` is set, the real path (or its nearest existing
//!   ancestor) must stay inside the real data directory

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use md5::Md5;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::fs::{self, DirBuilder, OpenOptions};
use tracing::{error, warn};

use crate::common;
use crate::context::StorageContext;
use crate::error::{ForbiddenReason, Result, StorageError};
use crate::lock::hex_digest;
use crate::path;
use crate::storage::{DirectoryListing, Storage};
use crate::stream::{ReadStream, WriteStream};
use crate::transfer::{self, can_do_local_transfer, same_instance, unwrap_storage};
use crate::types::{FileType, FreeSpace, Stat, StorageKind, WriteMode};

/// Identity and ownership of a local storage.
pub trait LocalFlavor: Send + Sync + 'static {
    fn kind(&self) -> StorageKind;

    fn id(&self, datadir: &str) -> String {
        format!("local::{}", datadir)
    }

    /// Fixed owner, overriding the actor lookup.
    fn owner(&self) -> Option<String> {
        None
    }
}

/// Plain data directory.
#[derive(Debug, Default)]
pub struct Plain;

impl LocalFlavor for Plain {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }
}

/// A user's home directory.
#[derive(Debug)]
pub struct Home {
    user: String,
}

impl LocalFlavor for Home {
    fn kind(&self) -> StorageKind {
        StorageKind::Home
    }

    fn id(&self, _datadir: &str) -> String {
        format!("home::{}", self.user)
    }

    fn owner(&self) -> Option<String> {
        Some(self.user.clone())
    }
}

/// Private temp directory, deleted on drop.
#[derive(Debug)]
pub struct Temporary {
    _dir: TempDir,
}

impl LocalFlavor for Temporary {
    fn kind(&self) -> StorageKind {
        StorageKind::Temporary
    }
}

pub type HomeStorage = LocalStorage<Home>;
pub type TemporaryStorage = LocalStorage<Temporary>;

pub struct LocalStorage<F: LocalFlavor = Plain> {
    /// Data directory as configured, with a trailing slash.
    datadir: String,
    root: PathBuf,
    /// Canonicalized root used for containment checks.
    real_root: PathBuf,
    flavor: F,
    context: StorageContext,
}

impl<F: LocalFlavor> std::fmt::Debug for LocalStorage<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("id", &self.id())
            .field("real_root", &self.real_root)
            .finish_non_exhaustive()
    }
}

impl LocalStorage<Plain> {
    /// Storage rooted at `datadir`. The directory does not have to exist yet.
    pub fn new(datadir: impl AsRef<Path>, context: StorageContext) -> Result<Self> {
        Self::with_flavor(datadir.as_ref(), Plain, context)
    }
}

impl LocalStorage<Home> {
    pub fn home(
        user: impl Into<String>,
        home_dir: impl AsRef<Path>,
        context: StorageContext,
    ) -> Result<Self> {
        let user = user.into();
        if user.is_empty() {
            return Err(StorageError::Invalid("home storage needs a user".into()));
        }
        Self::with_flavor(home_dir.as_ref(), Home { user }, context)
    }

    pub fn user(&self) -> &str {
        &self.flavor.user
    }
}

impl LocalStorage<Temporary> {
    /// Storage over a fresh temp directory.
    pub fn temporary(context: StorageContext) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_path_buf();
        Self::with_flavor(&root, Temporary { _dir: dir }, context)
    }
}

impl<F: LocalFlavor> LocalStorage<F> {
    fn with_flavor(datadir: &Path, flavor: F, context: StorageContext) -> Result<Self> {
        let Some(display) = datadir.to_str() else {
            return Err(StorageError::Invalid(format!(
                "data directory is not valid UTF-8: {}",
                datadir.display()
            )));
        };
        if display.is_empty() {
            return Err(StorageError::Invalid("missing data directory".into()));
        }
        let mut datadir = display.replace("//", "/");
        if !datadir.ends_with('/') {
            datadir.push('/');
        }
        let root = PathBuf::from(&datadir);
        let real_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Ok(Self {
            datadir,
            root,
            real_root,
            flavor,
            context,
        })
    }

    pub fn datadir(&self) -> &str {
        &self.datadir
    }

    fn umask(&self) -> u32 {
        self.context.config().umask
    }

    /// Absolute filesystem path for a storage path.
    pub async fn get_source_path(&self, path: &str) -> Result<PathBuf> {
        if self.context.validator().is_blacklisted(path) {
            return Err(StorageError::forbidden(path, ForbiddenReason::Blacklisted));
        }
        let clean = path::normalize(path)?;
        if clean.is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(&clean);
        if self.context.config().allow_symlinks {
            return Ok(full);
        }

        // Missing targets are checked through their nearest existing ancestor.
        let mut current = clean.as_str();
        loop {
            let candidate = self.root.join(current);
            match fs::canonicalize(&candidate).await {
                Ok(real) if real.starts_with(&self.real_root) => return Ok(full),
                Ok(real) => {
                    error!(
                        path = %full.display(),
                        real = %real.display(),
                        root = %self.real_root.display(),
                        "following symlinks is not allowed"
                    );
                    return Err(StorageError::forbidden(path, ForbiddenReason::SymlinkEscape));
                }
                Err(_) => {
                    let dangling = fs::symlink_metadata(&candidate)
                        .await
                        .is_ok_and(|meta| meta.file_type().is_symlink());
                    if dangling {
                        warn!(path = %candidate.display(), "refusing dangling symlink");
                        return Err(StorageError::forbidden(path, ForbiddenReason::SymlinkEscape));
                    }
                    current = path::dirname(current);
                    if current.is_empty() {
                        return Ok(full);
                    }
                }
            }
        }
    }

    /// On case-insensitive filesystems a direct lookup cannot be trusted, so
    /// every segment is matched by scanning its parent. An exact match wins
    /// over a case-folded one.
    async fn resolve_case(&self, clean: &str) -> Result<Option<PathBuf>> {
        let mut current = self.root.clone();
        for segment in clean.split('/').filter(|s| !s.is_empty()) {
            match match_entry(&current, segment).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        // The folded path may cross a different symlink than the exact one.
        if !self.context.config().allow_symlinks {
            match fs::canonicalize(&current).await {
                Ok(real) if real.starts_with(&self.real_root) => {}
                Ok(_) => {
                    return Err(StorageError::forbidden(clean, ForbiddenReason::SymlinkEscape));
                }
                Err(e) if is_missing(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(current))
    }

    async fn metadata(&self, path: &str) -> Result<Option<(PathBuf, std::fs::Metadata)>> {
        let mut full = self.get_source_path(path).await?;
        let clean = path::normalize(path)?;
        if self.context.config().case_insensitive && !clean.is_empty() {
            match self.resolve_case(&clean).await? {
                Some(resolved) => full = resolved,
                None => return Ok(None),
            }
        }
        match fs::metadata(&full).await {
            Ok(meta) => Ok(Some((full, meta))),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail with `Forbidden` if any entry below `dir` is blacklisted.
    fn scan_for_blacklisted<'a>(&'a self, dir: PathBuf, rel: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = path::join(&rel, &name);
                if self.context.validator().is_blacklisted(&name) {
                    return Err(StorageError::forbidden(child, ForbiddenReason::Blacklisted));
                }
                if entry.file_type().await?.is_dir() {
                    self.scan_for_blacklisted(entry.path(), child).await?;
                }
            }
            Ok(())
        })
    }

    /// `scan_for_blacklisted` on `full` when it is an existing directory.
    async fn guard_tree(&self, full: &Path, path: &str) -> Result<()> {
        match fs::symlink_metadata(full).await {
            Ok(meta) if meta.is_dir() => {
                self.scan_for_blacklisted(full.to_path_buf(), path::normalize(path)?)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn create_dir(&self, full: &Path) -> io::Result<()> {
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o777 & !self.umask());
        builder.create(full).await
    }

    fn file_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        #[cfg(unix)]
        options.mode(0o666 & !self.umask());
        options
    }

    /// Filesystem copy between absolute paths, recursing into directories.
    fn copy_local<'a>(
        &'a self,
        source: PathBuf,
        target: PathBuf,
        preserve_mtime: bool,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if source == target {
                return Ok(());
            }
            let meta = fs::metadata(&source).await?;
            if meta.is_dir() {
                remove_local(&target).await?;
                self.create_dir(&target).await?;
                let mut entries = fs::read_dir(&source).await?;
                while let Some(entry) = entries.next_entry().await? {
                    self.copy_local(entry.path(), target.join(entry.file_name()), preserve_mtime)
                        .await?;
                }
                return Ok(());
            }
            if self.context.config().unlink_on_truncate {
                remove_local(&target).await?;
            }
            fs::copy(&source, &target).await?;
            if preserve_mtime {
                if let Ok(modified) = meta.modified() {
                    set_mtime(&target, modified).await?;
                }
            }
            Ok(())
        })
    }

    async fn rename_local(&self, source: &Path, target: &Path) -> io::Result<()> {
        if source == target {
            return Ok(());
        }
        remove_local(target).await?;
        match fs::rename(source, target).await {
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                self.copy_local(source.to_path_buf(), target.to_path_buf(), true)
                    .await?;
                remove_local(source).await
            }
            other => other,
        }
    }

    /// Absolute source and target paths when the filesystem shortcut applies.
    ///
    /// Both trees are scanned first: the shortcut copies the source and
    /// replaces the target without going through the storage API.
    async fn fast_path(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<Option<(PathBuf, PathBuf)>> {
        if !can_do_local_transfer(source) {
            return Ok(None);
        }
        let Some(from) = source.local_source_path(source_path).await else {
            return Ok(None);
        };
        let from = from?;
        let to = self.get_source_path(target_path).await?;
        self.guard_tree(&from, source_path).await?;
        self.guard_tree(&to, target_path).await?;
        Ok(Some((from, to)))
    }
}

fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Entry of `dir` named `name`, exactly or else case-folded.
async fn match_entry(dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if is_missing(&e) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let wanted = name.to_lowercase();
    let mut folded = None;
    while let Some(entry) = entries.next_entry().await? {
        let entry_name = entry.file_name();
        if entry_name == name {
            return Ok(Some(entry.path()));
        }
        if folded.is_none() && entry_name.to_string_lossy().to_lowercase() == wanted {
            folded = Some(entry.path());
        }
    }
    Ok(folded)
}

fn not_found_or(path: &str, e: io::Error) -> StorageError {
    if is_missing(&e) {
        StorageError::not_found(path)
    } else {
        e.into()
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|since| i64::try_from(since.as_secs()).ok())
        .unwrap_or(0)
}

async fn remove_local(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).await,
        Ok(_) => fs::remove_file(target).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn set_mtime(target: &Path, mtime: SystemTime) -> io::Result<()> {
    let file = fs::File::open(target).await?.into_std().await;
    file.set_modified(mtime)
}

#[cfg(unix)]
fn access(full: &Path, mode: rustix::fs::Access) -> bool {
    rustix::fs::access(full, mode).is_ok()
}

#[async_trait]
impl<F: LocalFlavor> Storage for LocalStorage<F> {
    fn id(&self) -> String {
        self.flavor.id(&self.datadir)
    }

    fn kind(&self) -> StorageKind {
        self.flavor.kind()
    }

    fn is_kind(&self, kind: StorageKind) -> bool {
        kind == self.flavor.kind() || kind == StorageKind::Local
    }

    fn context(&self) -> &StorageContext {
        &self.context
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        let Some((full, meta)) = self.metadata(path).await? else {
            return Ok(None);
        };
        let file_type = if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        Ok(Some(Stat {
            file_type,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: mtime_of(&meta),
            full_path: Some(full),
        }))
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        let full = self.get_source_path(path).await?;
        let file = fs::File::open(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;
        if file.metadata().await?.is_dir() {
            return Err(StorageError::io(format!("{} is a directory", path)));
        }
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let full = self.get_source_path(path).await?;
        if mode == WriteMode::Truncate && self.context.config().unlink_on_truncate {
            match fs::remove_file(&full).await {
                Err(e) if !is_missing(&e) => return Err(e.into()),
                _ => {}
            }
        }
        let mut options = self.file_options();
        options.write(true).create(true);
        match mode {
            WriteMode::Truncate => {
                options.truncate(true);
            }
            WriteMode::Append => {
                options.append(true);
            }
        }
        let file = options
            .open(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;
        Ok(WriteStream::new(path, file))
    }

    async fn list_directory(&self, path: &str) -> Result<DirectoryListing> {
        let full = self.get_source_path(path).await?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| not_found_or(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!(name = ?raw, "skipping entry with non UTF-8 name"),
            }
        }
        Ok(DirectoryListing::new(names))
    }

    async fn mkdir(&self, path: &str) -> Result<bool> {
        let full = self.get_source_path(path).await?;
        if fs::symlink_metadata(&full).await.is_ok() {
            return Ok(false);
        }
        match self.create_dir(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<bool> {
        if !self.is_deletable(path).await? {
            return Ok(false);
        }
        let full = self.get_source_path(path).await?;
        match fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Ok(false),
        }
        let rel = path::normalize(path)?;
        self.scan_for_blacklisted(full.clone(), rel).await?;
        fs::remove_dir_all(&full).await?;
        Ok(true)
    }

    async fn unlink(&self, path: &str) -> Result<bool> {
        match self.file_type(path).await? {
            Some(FileType::Directory) => self.rmdir(path).await,
            Some(FileType::File) => {
                let full = self.get_source_path(path).await?;
                match fs::remove_file(&full).await {
                    Ok(()) => Ok(true),
                    Err(e) if is_missing(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            None => Ok(false),
        }
    }

    #[cfg(unix)]
    async fn is_readable(&self, path: &str) -> Result<bool> {
        let full = self.get_source_path(path).await?;
        Ok(access(&full, rustix::fs::Access::READ_OK))
    }

    #[cfg(unix)]
    async fn is_updatable(&self, path: &str) -> Result<bool> {
        let full = self.get_source_path(path).await?;
        Ok(access(&full, rustix::fs::Access::WRITE_OK))
    }

    async fn has_updated(&self, path: &str, since: i64) -> Result<bool> {
        match self.stat(path).await? {
            Some(stat) => Ok(stat.mtime > since),
            None => Ok(true),
        }
    }

    async fn get_etag(&self, path: &str) -> Result<String> {
        let Some((_, meta)) = self.metadata(path).await? else {
            return Ok(hex_digest::<Md5>(b""));
        };
        if meta.is_dir() {
            return Ok(common::random_etag());
        }
        let mut to_hash = mtime_of(&meta).to_string();
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            to_hash.push_str(&meta.ino().to_string());
            to_hash.push_str(&meta.dev().to_string());
        }
        to_hash.push_str(&meta.len().to_string());
        Ok(hex_digest::<Md5>(to_hash.as_bytes()))
    }

    async fn get_owner(&self, _path: &str) -> Result<Option<String>> {
        Ok(self.flavor.owner().or_else(|| self.context.owner()))
    }

    #[cfg(unix)]
    async fn free_space(&self, path: &str) -> Result<FreeSpace> {
        let mut full = self.get_source_path(path).await?;
        if !fs::metadata(&full).await.is_ok_and(|meta| meta.is_dir()) {
            full = full.parent().map(Path::to_path_buf).unwrap_or(full);
        }
        Ok(match rustix::fs::statvfs(&full) {
            Ok(stats) => FreeSpace::Bytes(stats.f_bavail.saturating_mul(stats.f_frsize)),
            Err(_) => FreeSpace::Unknown,
        })
    }

    async fn rename(&self, source: &str, target: &str) -> Result<bool> {
        let source_parent = path::dirname(source.trim_matches('/'));
        let target_parent = path::dirname(target.trim_matches('/'));
        if !self.is_updatable(source_parent).await? {
            error!(path = source_parent, "unable to rename, source directory is not writable");
            return Ok(false);
        }
        if !self.is_updatable(target_parent).await? {
            error!(path = target_parent, "unable to rename, target directory is not writable");
            return Ok(false);
        }
        if !self.file_exists(source).await? {
            error!(path = source, "unable to rename, source does not exist");
            return Ok(false);
        }
        let from = self.get_source_path(source).await?;
        let to = self.get_source_path(target).await?;
        self.guard_tree(&to, target).await?;
        self.rename_local(&from, &to).await?;
        self.remove_cached_file(source);
        Ok(true)
    }

    async fn copy(&self, source: &str, target: &str) -> Result<bool> {
        if self.is_dir(source).await? {
            return common::copy(self, source, target).await;
        }
        let from = self.get_source_path(source).await?;
        let to = self.get_source_path(target).await?;
        self.guard_tree(&to, target).await?;
        match self.copy_local(from, to, false).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(source, target, error = %e, "failed to copy file");
                Ok(false)
            }
        }
    }

    async fn touch(&self, path: &str, mtime: Option<i64>) -> Result<bool> {
        let exists = self.file_exists(path).await?;
        if exists && !self.is_updatable(path).await? {
            return Ok(false);
        }
        let full = self.get_source_path(path).await?;
        if !exists {
            self.file_options()
                .write(true)
                .create(true)
                .open(&full)
                .await
                .map_err(|e| not_found_or(path, e))?;
        }
        let when = match mtime {
            Some(secs) => UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0)),
            None => SystemTime::now(),
        };
        set_mtime(&full, when).await?;
        Ok(true)
    }

    async fn copy_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
        preserve_mtime: bool,
    ) -> Result<bool> {
        let (inner, inner_path) = unwrap_storage(source, source_path);
        if same_instance(self, &*inner) {
            return self.copy(&inner_path, target_path).await;
        }
        let Some((from, to)) = self.fast_path(source, source_path, target_path).await? else {
            return transfer::stream_tree(self, source, source_path, target_path, preserve_mtime)
                .await;
        };
        match self.copy_local(from, to, preserve_mtime).await {
            Ok(()) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(StorageError::Io(e)
                .context(format!("failed to copy {} to {}", source_path, target_path))),
        }
    }

    async fn move_from_storage(
        &self,
        source: &dyn Storage,
        source_path: &str,
        target_path: &str,
    ) -> Result<bool> {
        let (inner, _) = unwrap_storage(source, source_path);
        if same_instance(self, &*inner) {
            return transfer::move_from_storage(self, source, source_path, target_path).await;
        }
        let Some((from, to)) = self.fast_path(source, source_path, target_path).await? else {
            return transfer::move_from_storage(self, source, source_path, target_path).await;
        };
        if !source.is_deletable(source_path).await? {
            return Ok(false);
        }
        self.rename_local(&from, &to).await.map_err(|e| {
            StorageError::Io(e).context(format!("failed to move {} to {}", source_path, target_path))
        })?;
        source.remove_cached_file(source_path);
        Ok(true)
    }

    async fn local_source_path(&self, path: &str) -> Option<Result<PathBuf>> {
        Some(self.get_source_path(path).await)
    }
}

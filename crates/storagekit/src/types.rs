//! Shared value types for the storage contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::path::PathBuf;
use std::str::FromStr;

/// Mimetype reported for directories.
pub const DIRECTORY_MIMETYPE: &str = "httpd/unix-directory";

/// File type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl FileType {
    /// Check if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Base metadata returned by `Storage::stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub file_type: FileType,
    /// Size in bytes. Directories may report 0 or a backend-specific value.
    pub size: u64,
    /// Modification time in epoch seconds, 0 when unknown.
    pub mtime: i64,
    /// Absolute source path, filled in by local storages for debugging.
    pub full_path: Option<PathBuf>,
}

/// Permission bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1);
    pub const UPDATE: Permissions = Permissions(2);
    pub const CREATE: Permissions = Permissions(4);
    pub const DELETE: Permissions = Permissions(8);
    pub const SHARE: Permissions = Permissions(16);
    pub const ALL: Permissions = Permissions(31);

    /// Build from raw bits, dropping unknown bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Permissions(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `self` without the bits of `other`.
    pub const fn without(self, other: Permissions) -> Self {
        Permissions(self.0 & !other.0)
    }

    /// Set or clear `other` depending on `value`.
    pub fn set(&mut self, other: Permissions, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;

    fn bitand(self, rhs: Self) -> Self {
        Permissions(self.0 & rhs.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, ch) in [
            (Permissions::READ, 'r'),
            (Permissions::UPDATE, 'u'),
            (Permissions::CREATE, 'c'),
            (Permissions::DELETE, 'd'),
            (Permissions::SHARE, 's'),
        ] {
            let shown = if self.contains(flag) { ch } else { '-' };
            write!(f, "{}", shown)?;
        }
        Ok(())
    }
}

/// Metadata for a single entry, as returned by `Storage::get_meta_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub mimetype: String,
    /// Modification time in epoch seconds, never 0 (unknown becomes "now").
    pub mtime: i64,
    /// Modification time as reported by the backend, 0 when unknown.
    pub storage_mtime: i64,
    /// Size in bytes, -1 for directories or unknown sizes.
    pub size: i64,
    pub etag: String,
    pub permissions: Permissions,
    pub name: String,
}

impl FileMetadata {
    pub fn is_dir(&self) -> bool {
        self.mimetype == DIRECTORY_MIMETYPE
    }
}

/// Advisory lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Shared,
    Exclusive,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Shared => write!(f, "shared"),
            LockType::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Free space report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpace {
    Bytes(u64),
    /// The backend cannot tell.
    Unknown,
    /// No quota applies.
    Unlimited,
    /// The backend has not computed the value yet.
    NotComputed,
}

impl FreeSpace {
    /// Decode the legacy signed representation (-1 not computed, -2 unknown, -3 unlimited).
    pub fn from_signed(value: i64) -> Self {
        match value {
            -3 => FreeSpace::Unlimited,
            -1 => FreeSpace::NotComputed,
            v if v < 0 => FreeSpace::Unknown,
            v => FreeSpace::Bytes(v as u64),
        }
    }
}

impl fmt::Display for FreeSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeSpace::Bytes(bytes) => write!(f, "{}", bytes),
            FreeSpace::Unknown => write!(f, "unknown"),
            FreeSpace::Unlimited => write!(f, "unlimited"),
            FreeSpace::NotComputed => write!(f, "not computed"),
        }
    }
}

/// Write handle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate.
    Truncate,
    /// Create or append to existing content.
    Append,
}

/// Digest algorithms supported by `Storage::hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(format!("unsupported hash algorithm: {}", other)),
        }
    }
}

/// Known storage kinds, used for capability probing instead of downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Local,
    Home,
    Temporary,
    Dav,
    Flysystem,
    Failed,
    /// Any wrapper, regardless of its layer.
    Wrapper,
    Jail,
    PermissionsMask,
    Availability,
    Encryption,
    GroupFolderAcl,
    Shared,
}

/// Legacy type names rewritten before comparison.
///
/// Callers written against the old class hierarchy probe with these names;
/// each maps onto the modern kind that replaced it.
pub const LEGACY_KIND_ALIASES: &[(&str, StorageKind)] = &[
    ("OC\\Files\\Storage\\Shared", StorageKind::Shared),
    ("OC\\Files\\Storage\\Local", StorageKind::Local),
    ("OC\\Files\\Storage\\Home", StorageKind::Home),
    ("OC\\Files\\Storage\\Temporary", StorageKind::Temporary),
    ("OC\\Files\\Storage\\DAV", StorageKind::Dav),
    ("OC\\Files\\Storage\\Wrapper\\Jail", StorageKind::Jail),
    ("OC\\Files\\Storage\\Wrapper\\PermissionsMask", StorageKind::PermissionsMask),
    ("OC\\Files\\Storage\\Wrapper\\Availability", StorageKind::Availability),
    ("OC\\Files\\Storage\\Wrapper\\Encryption", StorageKind::Encryption),
];

impl StorageKind {
    const ALL: [StorageKind; 13] = [
        StorageKind::Local,
        StorageKind::Home,
        StorageKind::Temporary,
        StorageKind::Dav,
        StorageKind::Flysystem,
        StorageKind::Failed,
        StorageKind::Wrapper,
        StorageKind::Jail,
        StorageKind::PermissionsMask,
        StorageKind::Availability,
        StorageKind::Encryption,
        StorageKind::GroupFolderAcl,
        StorageKind::Shared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::Home => "home",
            StorageKind::Temporary => "temporary",
            StorageKind::Dav => "dav",
            StorageKind::Flysystem => "flysystem",
            StorageKind::Failed => "failed",
            StorageKind::Wrapper => "wrapper",
            StorageKind::Jail => "jail",
            StorageKind::PermissionsMask => "permissions_mask",
            StorageKind::Availability => "availability",
            StorageKind::Encryption => "encryption",
            StorageKind::GroupFolderAcl => "groupfolder_acl",
            StorageKind::Shared => "shared",
        }
    }

    /// Resolve a probe name, applying the legacy alias table first.
    pub fn from_name(name: &str) -> Option<StorageKind> {
        let name = name.trim_start_matches('\\');
        if let Some((_, kind)) = LEGACY_KIND_ALIASES.iter().find(|(legacy, _)| *legacy == name) {
            return Some(*kind);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability record used to skip storages known to be unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    /// Epoch seconds of the last availability change.
    pub last_checked: i64,
}

impl Default for Availability {
    fn default() -> Self {
        Self {
            available: true,
            last_checked: 0,
        }
    }
}

/// Guess a mimetype from a file name's extension.
pub fn mimetype_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return "application/octet-stream",
    };
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "odt" => "application/vnd.oasis.opendocument.text",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

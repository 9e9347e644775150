//! Error types for Storagekit
//!
//! Every backend and wrapper reports failures through [`StorageError`]. The
//! variants form a small taxonomy callers can branch on:
//! - `NotFound`, `Forbidden`, `Locked` describe the target path
//! - `Invalid` and `NotAvailable` describe the storage itself
//! - `Io` covers unclassified local read/write failures
//!
//! Transport failures are classified once, at the backend boundary. Generic
//! code only adds context via [`StorageError::context`], which keeps the
//! original [`ErrorKind`] visible.

use std::fmt;
use thiserror::Error;

/// Result type alias using Storagekit's error.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Target path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path failed validation or access was denied.
    #[error("forbidden: {path}: {reason}")]
    Forbidden {
        path: String,
        reason: ForbiddenReason,
    },

    /// Lock conflict on a path.
    #[error("\"{path}\" is locked{}", holder_suffix(.existing))]
    Locked {
        path: String,
        /// Readable description of the existing lock, when the provider knows it.
        existing: Option<String>,
    },

    /// Storage configuration or credentials are permanently unusable.
    #[error("storage is invalid: {0}")]
    Invalid(String),

    /// Storage is temporarily unreachable.
    #[error("storage is not available: {0}")]
    NotAvailable(String),

    /// I/O error from a local read/write primitive.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error with context added by generic code.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StorageError>,
    },

    /// Internal error for programming mistakes (e.g. a broken wrapper factory).
    #[error("internal error: {0}")]
    Internal(String),
}

fn holder_suffix(existing: &Option<String>) -> String {
    match existing {
        Some(holder) => format!(", existing lock on {}", holder),
        None => String::new(),
    }
}

/// Error category, independent of context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Locked,
    Invalid,
    NotAvailable,
    Io,
    Internal,
}

impl StorageError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a Forbidden error.
    pub fn forbidden(path: impl Into<String>, reason: ForbiddenReason) -> Self {
        Self::Forbidden {
            path: path.into(),
            reason,
        }
    }

    /// Create a Locked error.
    pub fn locked(path: impl Into<String>, existing: Option<String>) -> Self {
        Self::Locked {
            path: path.into(),
            existing,
        }
    }

    /// Create a NotAvailable error.
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable(message.into())
    }

    /// Create a generic I/O error from a message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }

    /// Wrap this error with context, keeping its kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Category of this error, looking through context layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::NotAvailable(_) => ErrorKind::NotAvailable,
            Self::Io(_) => ErrorKind::Io,
            Self::Context { source, .. } => source.kind(),
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is a NotFound error (possibly wrapped).
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Innermost error, with context layers removed.
    pub fn root(&self) -> &StorageError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Reason a path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// Resolved path leaves the storage root through a symlink.
    SymlinkEscape,
    /// `..` segments climb above the storage root.
    PathEscape,
    /// File name is on the blacklist (e.g. `.htaccess`).
    Blacklisted,
    /// Name is empty or only whitespace.
    EmptyName,
    /// Name is `.` or `..`.
    ReservedName,
    /// Name is a reserved word (e.g. `*`).
    ReservedWord,
    /// Name contains a character that cannot be stored.
    InvalidCharacter(String),
    /// 4-byte UTF-8 characters are not supported by the persistence layer.
    FourByteCharacter,
    /// Name exceeds the length limit.
    NameTooLong { length: usize, limit: usize },
    /// Wrapper denied the operation.
    PermissionDenied,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForbiddenReason::SymlinkEscape => write!(f, "path resolves outside the storage root"),
            ForbiddenReason::PathEscape => write!(f, "path climbs above the storage root"),
            ForbiddenReason::Blacklisted => write!(f, "file name is blacklisted"),
            ForbiddenReason::EmptyName => write!(f, "file name must not be empty"),
            ForbiddenReason::ReservedName => write!(f, "file name is a reserved name"),
            ForbiddenReason::ReservedWord => write!(f, "file name is a reserved word"),
            ForbiddenReason::InvalidCharacter(ch) => {
                write!(f, "file name contains invalid character {}", ch)
            }
            ForbiddenReason::FourByteCharacter => {
                write!(f, "4-byte characters are not supported in file names")
            }
            ForbiddenReason::NameTooLong { length, limit } => {
                write!(
                    f,
                    "file name too long: {} bytes exceeds {} byte limit",
                    length, limit
                )
            }
            ForbiddenReason::PermissionDenied => write!(f, "permission denied"),
        }
    }
}

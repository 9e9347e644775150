//! Storage configuration.
//!
//! Tunables consumed when a storage is constructed. Loaded from JSON by the
//! CLI or built in code with the builder setters.
//!
//! # Example
//!
//! ```rust
//! use storagekit::StorageConfig;
//!
//! let config = StorageConfig::new()
//!     .umask(0o027)
//!     .case_insensitive(true)
//!     .lock_debug(true);
//! assert_eq!(config.umask, 0o027);
//! ```

use serde::{Deserialize, Serialize};

/// Default umask applied to created files and directories.
pub const DEFAULT_UMASK: u32 = 0o022;

/// Default maximum file name length in bytes.
pub const DEFAULT_MAX_FILENAME_LENGTH: usize = 250;

/// Default delay before an unavailable storage is probed again (10 minutes).
pub const DEFAULT_AVAILABILITY_RECHECK_SECS: u64 = 600;

/// Default WebDAV request timeout (30 seconds).
pub const DEFAULT_DAV_TIMEOUT_SECS: u64 = 30;

/// Storage configuration.
///
/// | Field | Default | Purpose |
/// |-------|---------|---------|
/// | `umask` | `0o022` | Mode mask for created files and directories |
/// | `case_insensitive` | `false` | Scan parents case-insensitively on lookups |
/// | `unlink_on_truncate` | `false` | Unlink before truncating (write-once stores) |
/// | `allow_symlinks` | `false` | Follow symlinks out of the data directory |
/// | `lock_debug` | `false` | Log every lock acquire/release/change |
/// | `supports_4byte_text` | `true` | Allow 4-byte UTF-8 in names |
/// | `blacklisted_files` | `[".htaccess"]` | Names never served or written |
/// | `max_filename_length` | 250 | Name length limit in bytes |
/// | `availability_recheck_secs` | 600 | Delay before re-probing a dead storage |
/// | `dav_timeout_secs` | 30 | WebDAV request timeout |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub umask: u32,
    pub case_insensitive: bool,
    pub unlink_on_truncate: bool,
    pub allow_symlinks: bool,
    pub lock_debug: bool,
    pub supports_4byte_text: bool,
    pub blacklisted_files: Vec<String>,
    pub max_filename_length: usize,
    pub availability_recheck_secs: u64,
    pub dav_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            umask: DEFAULT_UMASK,
            case_insensitive: false,
            unlink_on_truncate: false,
            allow_symlinks: false,
            lock_debug: false,
            supports_4byte_text: true,
            blacklisted_files: vec![".htaccess".to_string()],
            max_filename_length: DEFAULT_MAX_FILENAME_LENGTH,
            availability_recheck_secs: DEFAULT_AVAILABILITY_RECHECK_SECS,
            dav_timeout_secs: DEFAULT_DAV_TIMEOUT_SECS,
        }
    }
}

impl StorageConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the umask for created files and directories.
    pub fn umask(mut self, umask: u32) -> Self {
        self.umask = umask & 0o777;
        self
    }

    /// Enable case-insensitive lookups on local storages.
    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    /// Unlink files before truncating them.
    pub fn unlink_on_truncate(mut self, enabled: bool) -> Self {
        self.unlink_on_truncate = enabled;
        self
    }

    /// Allow symlinks that resolve outside the data directory.
    ///
    /// # Warning
    ///
    /// This disables symlink-escape protection on local storages.
    pub fn allow_symlinks(mut self, enabled: bool) -> Self {
        self.allow_symlinks = enabled;
        self
    }

    /// Log every lock operation.
    pub fn lock_debug(mut self, enabled: bool) -> Self {
        self.lock_debug = enabled;
        self
    }

    /// Declare whether the persistence layer can store 4-byte UTF-8.
    pub fn supports_4byte_text(mut self, enabled: bool) -> Self {
        self.supports_4byte_text = enabled;
        self
    }

    /// Replace the file name blacklist.
    pub fn blacklisted_files(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blacklisted_files = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum file name length in bytes.
    pub fn max_filename_length(mut self, limit: usize) -> Self {
        self.max_filename_length = limit;
        self
    }

    /// Set the availability recheck delay.
    pub fn availability_recheck_secs(mut self, secs: u64) -> Self {
        self.availability_recheck_secs = secs;
        self
    }

    /// Set the WebDAV request timeout.
    pub fn dav_timeout_secs(mut self, secs: u64) -> Self {
        self.dav_timeout_secs = secs;
        self
    }
}

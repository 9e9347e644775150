//! File name validation.
//!
//! [`FilenameValidator`] implements the checks behind `Storage::verify_path`
//! and the blacklist lookup local storages run before touching the disk.
//!
//! Rejected names:
//! - empty or whitespace-only names
//! - `.` and `..`
//! - 4-byte UTF-8 characters, when the persistence layer cannot store them
//! - names longer than `max_filename_length` bytes
//! - names containing `/` or `\`
//! - reserved words (`*`) and blacklisted names (`.htaccess`)
//! - control characters and bidi overrides

use crate::config::StorageConfig;
use crate::error::{ForbiddenReason, Result, StorageError};
use crate::path;

/// Names that can never be used as file names.
pub const RESERVED_WORDS: &[&str] = &["*"];

/// Validates file names against a storage configuration.
#[derive(Debug, Clone)]
pub struct FilenameValidator {
    blacklist: Vec<String>,
    max_length: usize,
    supports_4byte_text: bool,
}

impl FilenameValidator {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            blacklist: config
                .blacklisted_files
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            max_length: config.max_filename_length,
            supports_4byte_text: config.supports_4byte_text,
        }
    }

    /// Whether the last segment of `path` is blacklisted (case-insensitive).
    pub fn is_blacklisted(&self, path: &str) -> bool {
        let name = path::basename(path).trim().to_lowercase();
        !name.is_empty() && self.blacklist.iter().any(|entry| *entry == name)
    }

    /// Validate a single file name.
    pub fn validate_filename(&self, name: &str) -> Result<()> {
        let forbidden = |reason| Err(StorageError::forbidden(name, reason));

        if name.trim().is_empty() {
            return forbidden(ForbiddenReason::EmptyName);
        }
        if path::is_ignored_dir(name) {
            return forbidden(ForbiddenReason::ReservedName);
        }
        if !self.supports_4byte_text && name.chars().any(|ch| ch.len_utf8() == 4) {
            return forbidden(ForbiddenReason::FourByteCharacter);
        }
        if name.len() > self.max_length {
            return forbidden(ForbiddenReason::NameTooLong {
                length: name.len(),
                limit: self.max_length,
            });
        }
        if let Some(ch) = name.chars().find(|ch| matches!(ch, '/' | '\\')) {
            return forbidden(ForbiddenReason::InvalidCharacter(format!("\"{}\"", ch)));
        }
        if RESERVED_WORDS.contains(&name) {
            return forbidden(ForbiddenReason::ReservedWord);
        }
        if self.is_blacklisted(name) {
            return forbidden(ForbiddenReason::Blacklisted);
        }
        if let Some(bad_char) = find_unsafe_char(name) {
            return forbidden(ForbiddenReason::InvalidCharacter(bad_char));
        }
        Ok(())
    }

    /// Validate `file_name` and every segment of its parent `path`.
    pub fn verify_path(&self, path: &str, file_name: &str) -> Result<()> {
        self.validate_filename(file_name)?;
        let parent = path.trim_matches('/');
        if !parent.is_empty() && parent != "." {
            self.verify_path(path::dirname(parent), path::basename(parent))
                .map_err(|e| e.context(format!("invalid parent path {}", path)))?;
        }
        Ok(())
    }
}

/// First character that must not appear in a file name, formatted for display.
fn find_unsafe_char(name: &str) -> Option<String> {
    for ch in name.chars() {
        // ASCII control characters (including DEL)
        if ch.is_ascii_control() {
            return Some(format!("U+{:04X}", ch as u32));
        }
        // C1 control characters
        if ('\u{0080}'..='\u{009F}').contains(&ch) {
            return Some(format!("U+{:04X}", ch as u32));
        }
        // Bidi override characters - can cause visual path confusion
        if ('\u{202A}'..='\u{202E}').contains(&ch) || ('\u{2066}'..='\u{2069}').contains(&ch) {
            return Some(format!("U+{:04X} (bidi override)", ch as u32));
        }
    }
    None
}

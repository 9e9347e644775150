//! Confine a storage to one of its subdirectories.

use std::sync::Arc;

use super::{Layer, Wrapper};
use crate::error::Result;
use crate::path;
use crate::storage::Storage;
use crate::types::StorageKind;

/// Jail storage: `path` in the jail is `root/path` in the wrapped storage.
pub type Jail = Wrapper<JailLayer>;

#[derive(Debug, Clone)]
pub struct JailLayer {
    root: String,
}

impl JailLayer {
    pub fn new(root: &str) -> Result<Self> {
        Ok(Self {
            root: path::normalize(root)?,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }
}

impl Layer for JailLayer {
    fn kind(&self) -> StorageKind {
        StorageKind::Jail
    }

    fn unwrap_path(&self, path: &str) -> String {
        path::join(&self.root, path)
    }

    fn wrap_path(&self, path: &str) -> Option<String> {
        if self.root.is_empty() {
            return Some(path.to_string());
        }
        if path == self.root {
            return Some(String::new());
        }
        path.strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }
}

impl Jail {
    /// Jail `inner` below `root`.
    pub fn jail(inner: Arc<dyn Storage>, root: &str) -> Result<Self> {
        Ok(Wrapper::new(inner, JailLayer::new(root)?))
    }
}

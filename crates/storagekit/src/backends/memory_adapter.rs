//! In-memory [`Adapter`].

// RwLock.read()/write().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::flysystem::{Adapter, AdapterEntry, AdapterError, AdapterMetadata, AdapterResult};
use crate::common;
use crate::path;
use crate::types::FileType;

#[derive(Debug, Clone)]
enum Entry {
    File { content: Vec<u8>, modified: i64 },
    Directory { modified: i64 },
}

impl Entry {
    fn file_type(&self) -> FileType {
        match self {
            Entry::File { .. } => FileType::File,
            Entry::Directory { .. } => FileType::Directory,
        }
    }
}

/// Adapter keeping every object in a map keyed by path.
///
/// Writes create missing parent directories. The root always exists.
#[derive(Debug)]
pub struct MemoryAdapter {
    id: String,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            String::new(),
            Entry::Directory {
                modified: common::now(),
            },
        );
        Self {
            id: id.into(),
            entries: RwLock::new(entries),
        }
    }

    fn key(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn not_found(path: &str) -> AdapterError {
        AdapterError::NotFound(path.to_string())
    }

    fn ensure_parents(entries: &mut BTreeMap<String, Entry>, path: &str) -> AdapterResult<()> {
        let mut parent = path::dirname(path);
        let now = common::now();
        while !parent.is_empty() {
            match entries.get(parent) {
                Some(Entry::Directory { .. }) => break,
                Some(Entry::File { .. }) => {
                    return Err(AdapterError::Other(format!("{} is not a directory", parent)));
                }
                None => {
                    entries.insert(parent.to_string(), Entry::Directory { modified: now });
                }
            }
            parent = path::dirname(parent);
        }
        Ok(())
    }

    /// Keys of `path` and everything below it.
    fn subtree(entries: &BTreeMap<String, Entry>, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        entries
            .keys()
            .filter(|key| key.as_str() == path || path.is_empty() || key.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn has(&self, path: &str) -> AdapterResult<bool> {
        Ok(self.entries.read().unwrap().contains_key(&Self::key(path)))
    }

    async fn read(&self, path: &str) -> AdapterResult<Vec<u8>> {
        match self.entries.read().unwrap().get(&Self::key(path)) {
            Some(Entry::File { content, .. }) => Ok(content.clone()),
            Some(Entry::Directory { .. }) => {
                Err(AdapterError::Other(format!("{} is a directory", path)))
            }
            None => Err(Self::not_found(path)),
        }
    }

    async fn write(&self, path: &str, contents: Vec<u8>) -> AdapterResult<()> {
        let key = Self::key(path);
        let mut entries = self.entries.write().unwrap();
        if let Some(Entry::Directory { .. }) = entries.get(&key) {
            return Err(AdapterError::Other(format!("{} is a directory", path)));
        }
        Self::ensure_parents(&mut entries, &key)?;
        entries.insert(
            key,
            Entry::File {
                content: contents,
                modified: common::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> AdapterResult<()> {
        let key = Self::key(path);
        let mut entries = self.entries.write().unwrap();
        match entries.get(&key) {
            Some(Entry::File { .. }) => {
                entries.remove(&key);
                Ok(())
            }
            Some(Entry::Directory { .. }) => {
                Err(AdapterError::Other(format!("{} is a directory", path)))
            }
            None => Err(Self::not_found(path)),
        }
    }

    async fn delete_dir(&self, path: &str) -> AdapterResult<()> {
        let key = Self::key(path);
        let mut entries = self.entries.write().unwrap();
        match entries.get(&key) {
            Some(Entry::Directory { .. }) => {
                for victim in Self::subtree(&entries, &key) {
                    if !victim.is_empty() {
                        entries.remove(&victim);
                    }
                }
                Ok(())
            }
            Some(Entry::File { .. }) => {
                Err(AdapterError::Other(format!("{} is not a directory", path)))
            }
            None => Err(Self::not_found(path)),
        }
    }

    async fn create_dir(&self, path: &str) -> AdapterResult<()> {
        let key = Self::key(path);
        let mut entries = self.entries.write().unwrap();
        Self::ensure_parents(&mut entries, &key)?;
        entries
            .entry(key)
            .or_insert(Entry::Directory {
                modified: common::now(),
            });
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> AdapterResult<()> {
        let from = Self::key(from);
        let to = Self::key(to);
        let mut entries = self.entries.write().unwrap();
        if !entries.contains_key(&from) {
            return Err(Self::not_found(&from));
        }
        Self::ensure_parents(&mut entries, &to)?;
        for key in Self::subtree(&entries, &from) {
            if let Some(entry) = entries.remove(&key) {
                let moved = format!("{}{}", to, &key[from.len()..]);
                entries.insert(moved, entry);
            }
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> AdapterResult<()> {
        let from = Self::key(from);
        let to = Self::key(to);
        let mut entries = self.entries.write().unwrap();
        match entries.get(&from) {
            Some(Entry::File { content, .. }) => {
                let content = content.clone();
                Self::ensure_parents(&mut entries, &to)?;
                entries.insert(
                    to,
                    Entry::File {
                        content,
                        modified: common::now(),
                    },
                );
                Ok(())
            }
            Some(Entry::Directory { .. }) => {
                Err(AdapterError::Other(format!("cannot copy directory {}", from)))
            }
            None => Err(Self::not_found(&from)),
        }
    }

    async fn list_contents(&self, path: &str) -> AdapterResult<Vec<AdapterEntry>> {
        let key = Self::key(path);
        let entries = self.entries.read().unwrap();
        match entries.get(&key) {
            Some(Entry::Directory { .. }) => Ok(entries
                .iter()
                .filter(|(child, _)| !child.is_empty() && path::dirname(child) == key)
                .map(|(child, entry)| AdapterEntry {
                    path: child.clone(),
                    file_type: entry.file_type(),
                })
                .collect()),
            Some(Entry::File { .. }) => {
                Err(AdapterError::Other(format!("{} is not a directory", path)))
            }
            None => Err(Self::not_found(path)),
        }
    }

    async fn metadata(&self, path: &str) -> AdapterResult<AdapterMetadata> {
        match self.entries.read().unwrap().get(&Self::key(path)) {
            Some(Entry::File { content, modified }) => Ok(AdapterMetadata {
                file_type: FileType::File,
                size: content.len() as u64,
                timestamp: *modified,
            }),
            Some(Entry::Directory { modified }) => Ok(AdapterMetadata {
                file_type: FileType::Directory,
                size: 0,
                timestamp: *modified,
            }),
            None => Err(Self::not_found(path)),
        }
    }
}

//! Mount table loaded from a JSON config file.
//!
//! ```json
//! {
//!   "config": { "umask": 18 },
//!   "mounts": [
//!     { "mount_point": "disk", "backend": { "type": "local", "datadir": "/srv/data" } },
//!     { "mount_point": "cloud", "jail": "team", "permissions": 1,
//!       "backend": { "type": "dav", "host": "https://dav.example.com", "user": "u", "password": "p" } }
//!   ]
//! }
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use storagekit::{BackendSpec, MountPoint, NoActor, Storage, StorageConfig, StorageFactory};

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub config: StorageConfig,
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Deserialize)]
pub struct MountConfig {
    #[serde(flatten)]
    pub mount: MountPoint,
    pub backend: BackendSpec,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// One local mount named `local` over `dir`.
    pub fn local(dir: &Path) -> Self {
        Self {
            config: StorageConfig::default(),
            mounts: vec![MountConfig {
                mount: MountPoint::new("local"),
                backend: BackendSpec::Local {
                    datadir: dir.to_path_buf(),
                },
            }],
        }
    }
}

/// Mounted storages by name.
pub struct Mounts {
    storages: BTreeMap<String, Arc<dyn Storage>>,
}

impl Mounts {
    pub fn mount(config: CliConfig) -> Result<Self> {
        let factory = StorageFactory::with_default_wrappers(Arc::new(config.config), Arc::new(NoActor));
        let mut storages = BTreeMap::new();
        for entry in config.mounts {
            let name = entry.mount.mount_point.trim_matches('/').to_string();
            if name.is_empty() || name.contains(':') {
                bail!("invalid mount point name: {:?}", entry.mount.mount_point);
            }
            if storages.contains_key(&name) {
                bail!("duplicate mount point: {}", name);
            }
            let storage = factory
                .get_instance(&entry.mount, &entry.backend)
                .with_context(|| format!("Failed to mount {}", name))?;
            tracing::debug!(mount = %name, storage = %storage.id(), "mounted");
            storages.insert(name, storage);
        }
        if storages.is_empty() {
            bail!("no mounts configured");
        }
        Ok(Self { storages })
    }

    /// Resolve `mount:path`. A bare path is allowed when only one mount exists.
    pub fn resolve(&self, address: &str) -> Result<(Arc<dyn Storage>, String)> {
        let (name, path) = match address.split_once(':') {
            Some((name, path)) => (name, path),
            None if self.storages.len() == 1 => {
                let Some(name) = self.storages.keys().next() else {
                    bail!("no mounts configured");
                };
                (name.as_str(), address)
            }
            None => bail!("address {:?} needs a mount prefix (mount:path)", address),
        };
        let storage = self
            .storages
            .get(name)
            .with_context(|| format!("unknown mount: {}", name))?;
        Ok((storage.clone(), path.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Storage>)> {
        self.storages.iter()
    }
}

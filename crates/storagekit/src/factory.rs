//! Storage construction and wrapper registration.
//!
//! A [`StorageFactory`] builds backends from a [`BackendSpec`] and applies
//! every registered wrapper, highest priority first. The first wrapper
//! applied sits closest to the backend; the last one is outermost and sees
//! every call first.

// Mutex.lock().unwrap() only panics on lock poisoning (prior panic
// while holding lock). This is intentional - corrupted state should not propagate.
#![allow(clippy::unwrap_used)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::backends::{
    DavConfig, FailedStorage, FlysystemStorage, HomeStorage, LocalStorage, MemoryAdapter,
    TemporaryStorage,
};
use crate::config::StorageConfig;
use crate::context::{ActorContext, NoActor, StorageContext};
use crate::error::{Result, StorageError};
use crate::storage::Storage;
use crate::types::{Permissions, StorageKind};
use crate::wrapper::{AvailabilityWrapper, Jail, PermissionsMask};

/// Builds a wrapper around a storage for a mount.
pub type WrapperFactory =
    Arc<dyn Fn(&MountPoint, Arc<dyn Storage>) -> Result<Arc<dyn Storage>> + Send + Sync>;

/// Where a storage is mounted and how the default wrappers treat it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub mount_point: String,
    /// Confine the mount to this subdirectory of the backend.
    #[serde(default)]
    pub jail: Option<String>,
    /// Permission mask bits (`READ=1 .. SHARE=16`).
    #[serde(default)]
    pub permissions: Option<u32>,
}

impl MountPoint {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            ..Default::default()
        }
    }

    pub fn jail(mut self, root: impl Into<String>) -> Self {
        self.jail = Some(root.into());
        self
    }

    pub fn permissions(mut self, mask: Permissions) -> Self {
        self.permissions = Some(mask.bits());
        self
    }
}

/// Backend selection, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendSpec {
    Local { datadir: PathBuf },
    Home { user: String, datadir: PathBuf },
    Temporary,
    Dav(DavConfig),
    Memory {
        #[serde(default = "default_memory_id")]
        id: String,
    },
}

fn default_memory_id() -> String {
    "memory".to_string()
}

struct Registration {
    name: String,
    priority: i32,
    factory: WrapperFactory,
}

/// Wrapper registry and backend constructor.
pub struct StorageFactory {
    config: Arc<StorageConfig>,
    actor: Arc<dyn ActorContext>,
    wrappers: Mutex<Vec<Registration>>,
    /// Memory adapters by id. Mounts naming the same id share one dataset.
    memory: Mutex<HashMap<String, Arc<MemoryAdapter>>>,
}

impl Default for StorageFactory {
    fn default() -> Self {
        Self::new(Arc::new(StorageConfig::default()), Arc::new(NoActor))
    }
}

impl std::fmt::Debug for StorageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .wrappers
            .lock()
            .unwrap()
            .iter()
            .map(|r| format!("{}({})", r.name, r.priority))
            .collect();
        f.debug_struct("StorageFactory")
            .field("config", &self.config)
            .field("wrappers", &names)
            .finish()
    }
}

impl StorageFactory {
    /// Factory with no wrappers registered.
    pub fn new(config: Arc<StorageConfig>, actor: Arc<dyn ActorContext>) -> Self {
        Self {
            config,
            actor,
            wrappers: Mutex::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Factory with the jail, permission mask and availability wrappers.
    pub fn with_default_wrappers(config: Arc<StorageConfig>, actor: Arc<dyn ActorContext>) -> Self {
        let factory = Self::new(config, actor);
        factory.add_storage_wrapper("jail", 100, Arc::new(jail_wrapper));
        factory.add_storage_wrapper("permissions_mask", 50, Arc::new(mask_wrapper));
        factory.add_storage_wrapper("availability", -10, Arc::new(availability_wrapper));
        factory
    }

    /// Register a wrapper. Returns `false` when the name is taken.
    pub fn add_storage_wrapper(&self, name: &str, priority: i32, factory: WrapperFactory) -> bool {
        let mut wrappers = self.wrappers.lock().unwrap();
        if wrappers.iter().any(|r| r.name == name) {
            return false;
        }
        wrappers.push(Registration {
            name: name.to_string(),
            priority,
            factory,
        });
        true
    }

    pub fn remove_storage_wrapper(&self, name: &str) {
        self.wrappers.lock().unwrap().retain(|r| r.name != name);
    }

    /// Names of registered wrappers in application order.
    pub fn wrapper_names(&self) -> Vec<String> {
        self.ordered().into_iter().map(|(name, _)| name).collect()
    }

    fn ordered(&self) -> Vec<(String, WrapperFactory)> {
        let wrappers = self.wrappers.lock().unwrap();
        let mut ordered: Vec<&Registration> = wrappers.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered
            .into_iter()
            .map(|r| (r.name.clone(), r.factory.clone()))
            .collect()
    }

    /// A fresh context sharing this factory's configuration and actor.
    pub fn context(&self) -> StorageContext {
        StorageContext::new(self.config.clone(), self.actor.clone())
    }

    /// Apply every registered wrapper to `storage`.
    pub fn wrap(&self, mount: &MountPoint, storage: Arc<dyn Storage>) -> Result<Arc<dyn Storage>> {
        let mut storage = storage;
        // Snapshot so factories may touch the registry.
        for (name, factory) in self.ordered() {
            storage = factory(mount, storage).map_err(|e| {
                StorageError::Internal(format!(
                    "storage wrapper {} failed for {}: {}",
                    name, mount.mount_point, e
                ))
            })?;
        }
        Ok(storage)
    }

    /// Build the backend for `spec` and wrap it. A backend that cannot be
    /// built is replaced by a [`FailedStorage`] carrying the error.
    pub fn get_instance(&self, mount: &MountPoint, spec: &BackendSpec) -> Result<Arc<dyn Storage>> {
        let storage = match self.build(spec) {
            Ok(storage) => storage,
            Err(e) => {
                warn!(mount = %mount.mount_point, error = %e, "storage could not be constructed");
                Arc::new(FailedStorage::new(&e, self.context()))
            }
        };
        debug!(mount = %mount.mount_point, storage = %storage.id(), "mounting storage");
        self.wrap(mount, storage)
    }

    fn memory_adapter(&self, id: &str) -> Arc<MemoryAdapter> {
        self.memory
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MemoryAdapter::new(id)))
            .clone()
    }

    fn build(&self, spec: &BackendSpec) -> Result<Arc<dyn Storage>> {
        let context = self.context();
        Ok(match spec {
            BackendSpec::Local { datadir } => Arc::new(LocalStorage::new(datadir, context)?),
            BackendSpec::Home { user, datadir } => {
                Arc::new(HomeStorage::home(user, datadir, context)?)
            }
            BackendSpec::Temporary => Arc::new(TemporaryStorage::temporary(context)?),
            BackendSpec::Dav(config) => build_dav(config, context)?,
            BackendSpec::Memory { id } => {
                Arc::new(FlysystemStorage::new(self.memory_adapter(id), context))
            }
        })
    }
}

#[cfg(feature = "dav")]
fn build_dav(config: &DavConfig, context: StorageContext) -> Result<Arc<dyn Storage>> {
    Ok(Arc::new(crate::backends::DavStorage::connect(config, context)?))
}

#[cfg(not(feature = "dav"))]
fn build_dav(_config: &DavConfig, _context: StorageContext) -> Result<Arc<dyn Storage>> {
    Err(StorageError::Invalid(
        "webdav support is not compiled in (enable the dav feature)".into(),
    ))
}

fn jail_wrapper(mount: &MountPoint, storage: Arc<dyn Storage>) -> Result<Arc<dyn Storage>> {
    match &mount.jail {
        Some(root) => Ok(Arc::new(Jail::jail(storage, root)?)),
        None => Ok(storage),
    }
}

fn mask_wrapper(mount: &MountPoint, storage: Arc<dyn Storage>) -> Result<Arc<dyn Storage>> {
    match mount.permissions {
        Some(bits) => Ok(Arc::new(PermissionsMask::masked(
            storage,
            Permissions::from_bits_truncate(bits),
        ))),
        None => Ok(storage),
    }
}

/// Remote storages get availability tracking.
fn availability_wrapper(_mount: &MountPoint, storage: Arc<dyn Storage>) -> Result<Arc<dyn Storage>> {
    if storage.is_kind(StorageKind::Local) || storage.is_kind(StorageKind::Failed) {
        return Ok(storage);
    }
    Ok(Arc::new(AvailabilityWrapper::tracking(storage)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wrapper<F>(f: F) -> WrapperFactory
    where
        F: Fn(&MountPoint, Arc<dyn Storage>) -> Result<Arc<dyn Storage>> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let factory = StorageFactory::default();
        assert!(factory.add_storage_wrapper("a", 1, wrapper(|_, s| Ok(s))));
        assert!(!factory.add_storage_wrapper("a", 99, wrapper(|_, s| Ok(s))));
        factory.remove_storage_wrapper("a");
        assert!(factory.add_storage_wrapper("a", 2, wrapper(|_, s| Ok(s))));
    }

    #[test]
    fn test_priority_order_is_stable() {
        let factory = StorageFactory::default();
        factory.add_storage_wrapper("low", -5, wrapper(|_, s| Ok(s)));
        factory.add_storage_wrapper("first", 10, wrapper(|_, s| Ok(s)));
        factory.add_storage_wrapper("second", 10, wrapper(|_, s| Ok(s)));
        factory.add_storage_wrapper("high", 50, wrapper(|_, s| Ok(s)));
        assert_eq!(
            factory.wrapper_names(),
            vec!["high", "first", "second", "low"]
        );
    }

    #[tokio::test]
    async fn test_highest_priority_is_innermost() {
        let factory = StorageFactory::default();
        factory.add_storage_wrapper(
            "mask",
            10,
            wrapper(|_, s| Ok(Arc::new(PermissionsMask::masked(s, Permissions::READ)))),
        );
        factory.add_storage_wrapper(
            "jail",
            20,
            wrapper(|_, s| Ok(Arc::new(Jail::jail(s, "inner")?))),
        );
        let storage = factory
            .get_instance(&MountPoint::new("/m"), &BackendSpec::Memory { id: "x".into() })
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::PermissionsMask);
        let jail = storage.wrapped_storage().unwrap();
        assert_eq!(jail.kind(), StorageKind::Jail);
        assert_eq!(jail.wrapped_storage().unwrap().kind(), StorageKind::Flysystem);
    }

    #[tokio::test]
    async fn test_wrapper_error_is_internal() {
        let factory = StorageFactory::default();
        factory.add_storage_wrapper(
            "broken",
            0,
            wrapper(|_, _| Err(StorageError::not_found("whatever"))),
        );
        let err = factory
            .get_instance(&MountPoint::new("/m"), &BackendSpec::Temporary)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_construction_failure_yields_failed_storage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let factory = StorageFactory::default();
        factory.add_storage_wrapper(
            "count",
            0,
            wrapper(move |_, s| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(s)
            }),
        );
        let spec = BackendSpec::Home {
            user: String::new(),
            datadir: PathBuf::from("/srv/home"),
        };
        let storage = factory.get_instance(&MountPoint::new("/m"), &spec).unwrap();
        assert_eq!(storage.id(), "failedstorage");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = storage.file_exists("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAvailable);
    }

    #[tokio::test]
    async fn test_default_wrappers_follow_mount_options() {
        let factory = StorageFactory::with_default_wrappers(
            Arc::new(StorageConfig::default()),
            Arc::new(NoActor),
        );
        let mount = MountPoint::new("/shared")
            .jail("team")
            .permissions(Permissions::READ);
        let storage = factory
            .get_instance(&mount, &BackendSpec::Memory { id: "m".into() })
            .unwrap();
        assert_eq!(storage.kind(), StorageKind::Availability);
        assert!(storage.is_kind(StorageKind::PermissionsMask));
        assert!(storage.is_kind(StorageKind::Jail));
        assert!(!storage.mkdir("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_mounts_with_same_id_share_data() {
        let factory = StorageFactory::default();
        let spec = BackendSpec::Memory { id: "shared".into() };
        let first = factory.get_instance(&MountPoint::new("/a"), &spec).unwrap();
        let second = factory.get_instance(&MountPoint::new("/b"), &spec).unwrap();
        let other = factory
            .get_instance(&MountPoint::new("/c"), &BackendSpec::Memory { id: "other".into() })
            .unwrap();

        first.write_all("note.txt", b"from a").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.read_all("note.txt").await.unwrap(), b"from a");
        assert_ne!(first.id(), other.id());
        assert!(!other.file_exists("note.txt").await.unwrap());
    }

    #[test]
    fn test_backend_spec_from_json() {
        let spec: BackendSpec =
            serde_json::from_str(r#"{"type": "local", "datadir": "/srv/data"}"#).unwrap();
        assert_eq!(
            spec,
            BackendSpec::Local {
                datadir: PathBuf::from("/srv/data")
            }
        );
        let spec: BackendSpec = serde_json::from_str(
            r#"{"type": "dav", "host": "https://h", "user": "u", "password": "p"}"#,
        )
        .unwrap();
        assert!(matches!(spec, BackendSpec::Dav(ref c) if c.host == "https://h"));
        let spec: BackendSpec = serde_json::from_str(r#"{"type": "memory"}"#).unwrap();
        assert_eq!(spec, BackendSpec::Memory { id: "memory".into() });
    }
}

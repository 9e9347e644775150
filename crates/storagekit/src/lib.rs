//! Storagekit - Pluggable storage backends with wrapper chains
//!
//! Part of the Everruns ecosystem.
//!
//! Every backend implements the async [`Storage`] contract: local disk
//! ([`LocalStorage`] and its home/temporary flavours), WebDAV
//! ([`DavStorage`]) and an adapter bridge ([`FlysystemStorage`]). Wrappers
//! ([`Jail`], [`PermissionsMask`], [`AvailabilityWrapper`]) layer behaviour
//! on top, and [`StorageFactory`] builds mounted storages with the
//! registered wrappers applied.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use storagekit::{Jail, Storage, StorageContext, TemporaryStorage};
//!
//! #[tokio::main]
//! async fn main() -> storagekit::Result<()> {
//!     let disk: Arc<dyn Storage> = Arc::new(TemporaryStorage::temporary(StorageContext::default())?);
//!     disk.mkdir("alice").await?;
//!
//!     let home = Jail::jail(disk.clone(), "alice")?;
//!     home.write_all("notes.txt", b"hello").await?;
//!     assert_eq!(disk.read_all("alice/notes.txt").await?, b"hello");
//!     Ok(())
//! }
//! ```

pub mod backends;
pub mod cache;
mod common;
mod config;
mod context;
mod error;
pub mod factory;
pub mod lock;
pub mod logging;
pub mod path;
mod storage;
pub mod stream;
pub mod transfer;
mod types;
mod validation;
pub mod wrapper;

pub use backends::{
    Adapter, AdapterEntry, AdapterError, AdapterMetadata, DavConfig, DavStorage, DavTransport,
    FailedStorage, FlysystemStorage, HomeStorage, LocalStorage, MemoryAdapter, TemporaryStorage,
    TransportError,
};
#[cfg(feature = "dav")]
pub use backends::ReqwestDavClient;
pub use cache::{Cache, CacheEntry, WatchPolicy};
pub use common::random_etag;
pub use config::StorageConfig;
pub use context::{ActorContext, NoActor, StaticActor, StorageContext};
pub use error::{ErrorKind, ForbiddenReason, Result, StorageError};
pub use factory::{BackendSpec, MountPoint, StorageFactory, WrapperFactory};
pub use lock::{LockConflict, LockProvider, MemoryLockProvider};
pub use storage::{DirectoryListing, Storage};
pub use stream::{ReadStream, WriteStream};
pub use types::{
    Availability, FileMetadata, FileType, FreeSpace, HashAlgorithm, LockType, Permissions, Stat,
    StorageKind, WriteMode, DIRECTORY_MIMETYPE, mimetype_for,
};
pub use validation::FilenameValidator;
pub use wrapper::{AvailabilityWrapper, Jail, Layer, PermissionsMask, Wrapper};

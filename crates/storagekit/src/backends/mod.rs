//! Storage backends.
//!
//! - [`LocalStorage`] and its [`HomeStorage`] / [`TemporaryStorage`] flavours
//!   serve a directory on the local filesystem.
//! - [`DavStorage`] talks to a WebDAV server.
//! - [`FlysystemStorage`] bridges an [`Adapter`] (e.g. [`MemoryAdapter`]).
//! - [`FailedStorage`] stands in for a backend that could not be built.

pub mod dav;
mod failed;
mod flysystem;
mod local;
mod memory_adapter;

#[cfg(feature = "dav")]
pub use dav::ReqwestDavClient;
pub use dav::{DavConfig, DavStorage, DavTransport, TransportError};
pub use failed::FailedStorage;
pub use flysystem::{Adapter, AdapterEntry, AdapterError, AdapterMetadata, FlysystemStorage};
pub use local::{Home, HomeStorage, LocalFlavor, LocalStorage, Plain, Temporary, TemporaryStorage};
pub use memory_adapter::MemoryAdapter;

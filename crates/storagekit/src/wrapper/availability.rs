//! Fail fast on storages known to be unreachable.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Layer, Wrapper};
use crate::common;
use crate::error::{ErrorKind, Result, StorageError};
use crate::storage::Storage;
use crate::types::StorageKind;

/// Availability-tracking storage.
///
/// While the wrapped storage is marked unavailable, calls fail with
/// `NotAvailable` without touching it. Once `availability_recheck_secs`
/// have passed since the last check, the next call probes it with `test()`.
/// Any `NotAvailable` error marks it unavailable again.
pub type AvailabilityWrapper = Wrapper<AvailabilityLayer>;

#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityLayer;

impl AvailabilityLayer {
    fn mark(inner: &dyn Storage, available: bool) {
        inner
            .context()
            .set_availability_at(available, common::now());
    }
}

#[async_trait]
impl Layer for AvailabilityLayer {
    fn kind(&self) -> StorageKind {
        StorageKind::Availability
    }

    async fn guard(&self, inner: &dyn Storage) -> Result<()> {
        let record = inner.get_availability();
        if record.available {
            return Ok(());
        }
        let ttl = inner.context().config().availability_recheck_secs as i64;
        if common::now() - record.last_checked <= ttl {
            return Err(StorageError::not_available(format!(
                "storage {} is temporarily not available",
                inner.id()
            )));
        }

        // Mark unavailable first so concurrent callers do not all probe.
        Self::mark(inner, false);
        let available = inner.test().await;
        Self::mark(inner, available);
        if available {
            info!(storage = %inner.id(), "storage is available again");
            Ok(())
        } else {
            Err(StorageError::not_available(format!(
                "storage {} is not available",
                inner.id()
            )))
        }
    }

    fn observe(&self, inner: &dyn Storage, error: &StorageError) {
        if error.kind() == ErrorKind::NotAvailable {
            warn!(storage = %inner.id(), error = %error, "marking storage unavailable");
            Self::mark(inner, false);
        }
    }
}

impl AvailabilityWrapper {
    pub fn tracking(inner: Arc<dyn Storage>) -> Self {
        Wrapper::new(inner, AvailabilityLayer)
    }
}

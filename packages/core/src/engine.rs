//! Seams to the external collaborators driven by the synchronizer.
//!
//! The protocol engine advertises storages to the USB host and serves the
//! transport; the metadata index catalogs the objects inside each storage.
//! Both are consumed through traits so the reconciliation logic can be
//! exercised without a USB gadget.

use std::path::Path;

use crate::error::Result;
use crate::storage::{StorageDescriptor, StorageId};

/// An MTP protocol engine.
pub trait ProtocolEngine: Send + Sync {
    /// Starts advertising a storage to the host.
    fn add_storage(&self, storage: &StorageDescriptor) -> Result<()>;

    /// Stops advertising a storage.
    fn remove_storage(&self, id: StorageId) -> Result<()>;

    /// Serves the transport until [`ProtocolEngine::stop`] is called or the
    /// transport fails. Blocks the calling thread.
    fn run(&self) -> Result<()>;

    /// Asks a running [`ProtocolEngine::run`] to return. Safe to call from any
    /// thread, before or during `run`.
    fn stop(&self);
}

/// The per-storage object catalog.
pub trait MetadataIndex: Send + Sync {
    /// Registers the objects under `path` as storage `id`.
    ///
    /// `extra` is an optional description override, empty for none.
    fn add_storage_path(
        &self,
        path: &Path,
        extra: &str,
        id: StorageId,
        scan_recursively: bool,
    ) -> Result<()>;

    /// Forgets every object of storage `id`.
    fn remove_storage(&self, id: StorageId) -> Result<()>;
}

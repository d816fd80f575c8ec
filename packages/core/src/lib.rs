//! mtp-server-core: Storage lifecycle for an MTP responder.
//!
//! This library keeps the storages an MTP device advertises to a USB host in
//! step with what is mounted and with the screen lock state of the local
//! user: the home directory plus every removable volume under the media root
//! are exposed while the session is unlocked and hidden while it is locked.
//!
//! # Modules
//!
//! - [`storage`]: Storage ids, entries and the registry
//! - [`sync`]: Exposure synchronizer (registry + lock state + engine calls)
//! - [`watcher`]: Media root watcher producing volume events
//! - [`session`]: logind session discovery and `LockedHint` monitoring
//! - [`engine`]: Protocol engine and metadata index seams
//! - [`responder`]: Bundled MTP responder serving the gadget transport
//! - [`container`]: MTP container codec
//! - [`index`]: Bundled object catalog
//! - [`transport`]: Gadget transport acquisition
//! - [`daemon`]: Startup, serving and shutdown
//! - [`config`]: Configuration file and resolved settings
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use mtp_server_core::{CatalogIndex, Config, Daemon, MtpResponder, SessionSetup, Transport};
//!
//! let settings = Config::load(None).unwrap().resolve().unwrap();
//!
//! // Blocks until the host enumerates the gadget
//! let abort = AtomicBool::new(false);
//! let transport =
//!     Transport::acquire(&settings.transport_path, settings.transport_retry(), &abort).unwrap();
//!
//! let engine = Arc::new(MtpResponder::new(transport.into_file(), settings.file_policy()).unwrap());
//! let index = Arc::new(CatalogIndex::new());
//!
//! let daemon = Daemon::start(&settings, SessionSetup::from_settings(&settings), engine, index)
//!     .unwrap();
//! daemon.run().unwrap();
//! daemon.shutdown().unwrap();
//! ```

pub mod config;
pub mod container;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod index;
pub mod responder;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, Settings};
pub use daemon::{Daemon, SessionSetup};
pub use engine::{MetadataIndex, ProtocolEngine};
pub use error::{Error, Result};
pub use index::CatalogIndex;
pub use responder::MtpResponder;
pub use storage::{StorageDescriptor, StorageEntry, StorageId};
pub use sync::{LockState, Synchronizer};
pub use transport::Transport;

//! Unified error types for the mtp-server-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

use crate::storage::StorageId;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The USB transport device node could not be opened.
    #[snafu(display("failed to open MTP transport at {}", path.display()))]
    TransportOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Transport acquisition was abandoned because shutdown was requested.
    #[snafu(display("gave up waiting for MTP transport at {}", path.display()))]
    TransportInterrupted { path: PathBuf },

    /// Reading from or writing to the transport failed while serving.
    #[snafu(display("MTP transport I/O failed"))]
    TransportIo { source: std::io::Error },

    /// Polling the transport or the wake pipe failed.
    #[snafu(display("failed to poll MTP transport"))]
    TransportPoll { source: nix::Error },

    /// The internal wake pipe of the serving loop could not be created or written.
    #[snafu(display("serving loop wake pipe failed"))]
    WakePipe { source: nix::Error },

    /// A received MTP container could not be decoded.
    #[snafu(display("malformed MTP container: {reason}"))]
    MalformedContainer { reason: String },

    /// The protocol engine does not know the given storage.
    #[snafu(display("storage {id} is not registered with the protocol engine"))]
    UnknownStorage { id: StorageId },

    /// The filesystem event source could not be created.
    #[snafu(display("failed to initialize filesystem watcher"))]
    WatcherInit { source: notify::Error },

    /// A watch on a directory could not be armed.
    #[snafu(display("failed to watch {}", path.display()))]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    /// The filesystem event source failed and stopped producing events.
    #[snafu(display("filesystem event source failed: {message}"))]
    WatcherFailed { message: String },

    /// The mount root could not be listed.
    #[snafu(display("failed to scan mount root {}", path.display()))]
    VolumeScan {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A call on the system bus failed.
    #[snafu(display("system bus call failed: {context}"))]
    Bus {
        context: String,
        source: zbus::Error,
    },

    /// The event loop runtime for the session monitor could not be built.
    #[snafu(display("failed to start session monitor runtime"))]
    SessionRuntime { source: std::io::Error },

    /// A worker thread could not be started.
    #[snafu(display("failed to spawn {name} thread"))]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },

    /// A session monitor thread panicked or could not be joined.
    #[snafu(display("session monitor thread terminated abnormally"))]
    SessionThread,

    /// Registering a storage with the metadata index failed.
    #[snafu(display("failed to index storage {id} at {}", path.display()))]
    IndexScan {
        id: StorageId,
        path: PathBuf,
        source: walkdir::Error,
    },

    /// Exposing a storage entry failed; the entry stays tracked but hidden.
    #[snafu(display("failed to expose storage '{name}'"))]
    Expose {
        name: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Hiding a storage entry failed; the entry is considered hidden anyway.
    #[snafu(display("failed to hide storage '{name}'"))]
    Hide {
        name: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// A reconciliation pass left some entries in the wrong state.
    #[snafu(display("reconciliation failed for: {}", names.join(", ")))]
    Reconcile { names: Vec<String> },

    /// The current user could not be looked up.
    #[snafu(display("failed to look up user {uid}"))]
    UserLookup { uid: u32, source: nix::Error },

    /// The current user has no passwd entry.
    #[snafu(display("no passwd entry for user {uid}"))]
    UserNotFound { uid: u32 },

    /// Config file cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected schema.
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for transport open errors.
    fn transport_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount root scan errors.
    fn scan_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for config read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn transport_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(TransportOpenSnafu { path: path.into() })
    }

    fn scan_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(VolumeScanSnafu { path: path.into() })
    }

    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }
}

/// Extension trait for adding context to system bus results.
pub trait BusResultExt<T> {
    /// Add a description of the bus call that failed.
    fn bus_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> BusResultExt<T> for std::result::Result<T, zbus::Error> {
    fn bus_context(self, context: impl Into<String>) -> Result<T> {
        self.context(BusSnafu {
            context: context.into(),
        })
    }
}

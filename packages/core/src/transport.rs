//! USB function transport acquisition.
//!
//! The gadget driver exposes the MTP function as a character device that only
//! appears once the host has enumerated the gadget, so opening it is retried
//! at a fixed interval until it succeeds or shutdown is requested.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, IoResultExt, Result};

/// Device node of the MTP gadget function.
pub const DEFAULT_TRANSPORT_PATH: &str = "/dev/mtp_usb";

/// Delay between attempts to open the transport.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Granularity at which the abort flag is checked while waiting.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// An opened transport endpoint.
#[derive(Debug)]
pub struct Transport {
    path: PathBuf,
    file: File,
}

impl Transport {
    /// Opens the transport once.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .transport_context(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Opens the transport, retrying every `interval` until it succeeds.
    ///
    /// Returns [`Error::TransportInterrupted`] once `abort` is set.
    pub fn acquire(path: impl AsRef<Path>, interval: Duration, abort: &AtomicBool) -> Result<Self> {
        let path = path.as_ref();
        loop {
            if abort.load(Ordering::SeqCst) {
                return Err(Error::TransportInterrupted {
                    path: path.to_path_buf(),
                });
            }

            match Self::open(path) {
                Ok(transport) => {
                    info!("Opened MTP transport {}", path.display());
                    return Ok(transport);
                }
                Err(Error::TransportOpen { ref source, .. })
                    if source.kind() == ErrorKind::NotFound =>
                {
                    info!("Waiting for {} to appear", path.display());
                }
                Err(e) => warn!("{}, retrying", snafu::Report::from_error(&e)),
            }

            wait(interval, abort);
        }
    }

    /// Returns the device node this transport was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the open device file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Consumes the transport, returning the device file.
    pub fn into_file(self) -> File {
        self.file
    }
}

fn wait(interval: Duration, abort: &AtomicBool) {
    let mut waited = Duration::ZERO;
    while waited < interval && !abort.load(Ordering::SeqCst) {
        let step = ABORT_CHECK_INTERVAL.min(interval - waited);
        thread::sleep(step);
        waited += step;
    }
}

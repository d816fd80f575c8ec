//! Minimal MTP responder.
//!
//! Serves the storage-enumeration part of the protocol over the gadget
//! transport: session handling, `GetStorageIDs` and `GetStorageInfo`. Storage
//! is added and removed at runtime through [`ProtocolEngine`], which is how
//! the synchronizer exposes and hides volumes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, trace, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::statvfs::statvfs;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use snafu::ResultExt;

use crate::container::{Container, ContainerType, Dataset, op, response};
use crate::engine::ProtocolEngine;
use crate::error::{Error, Result, TransportIoSnafu, TransportPollSnafu, WakePipeSnafu};
use crate::storage::{StorageDescriptor, StorageId, StorageKind};

/// Largest container read from the transport in one go.
const READ_BUFFER_SIZE: usize = 16 * 1024;

const STORAGE_TYPE_FIXED_RAM: u16 = 0x0003;
const STORAGE_TYPE_REMOVABLE_RAM: u16 = 0x0004;
const FILESYSTEM_GENERIC_HIERARCHICAL: u16 = 0x0002;
const ACCESS_READ_WRITE: u16 = 0x0000;
const FREE_OBJECTS_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Ownership and permissions given to objects created by hosts.
///
/// The responder serves storage enumeration only and creates no objects, so
/// it just logs the policy when serving starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilePolicy {
    pub group: u32,
    pub file_mode: u32,
    pub directory_mode: u32,
}

impl FilePolicy {
    /// Mode for a new object.
    pub fn mode_for(&self, is_dir: bool) -> u32 {
        if is_dir {
            self.directory_mode
        } else {
            self.file_mode
        }
    }
}

/// Protocol engine answering a host over the gadget transport.
pub struct MtpResponder {
    transport: File,
    policy: FilePolicy,
    storages: RwLock<BTreeMap<StorageId, StorageDescriptor>>,
    session: Mutex<Option<u32>>,
    wake_rx: File,
    wake_tx: File,
    stopped: AtomicBool,
}

impl MtpResponder {
    /// Creates a responder serving `transport`.
    pub fn new(transport: File, policy: FilePolicy) -> Result<Self> {
        let (rx, tx): (OwnedFd, OwnedFd) = nix::unistd::pipe().context(WakePipeSnafu)?;
        Ok(Self {
            transport,
            policy,
            storages: RwLock::new(BTreeMap::new()),
            session: Mutex::new(None),
            wake_rx: File::from(rx),
            wake_tx: File::from(tx),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn file_policy(&self) -> FilePolicy {
        self.policy
    }

    /// Ids of the storages currently advertised, ascending.
    pub fn storage_ids(&self) -> Vec<StorageId> {
        self.storages.read().keys().copied().collect()
    }

    /// Answers one container received from the host.
    ///
    /// Returns the containers to send back in order; empty for containers
    /// that are not commands.
    pub fn handle(&self, request: &Container) -> Vec<Container> {
        if request.kind != ContainerType::Command {
            debug!("Ignoring {:?} container 0x{:04x}", request.kind, request.code);
            return Vec::new();
        }

        let tid = request.transaction_id;
        trace!("Command 0x{:04x} (transaction {})", request.code, tid);

        match request.code {
            op::OPEN_SESSION => vec![self.open_session(request)],
            op::CLOSE_SESSION => {
                let mut session = self.session.lock();
                match session.take() {
                    Some(id) => {
                        debug!("Closed session {}", id);
                        vec![Container::response(response::OK, tid, &[])]
                    }
                    None => vec![Container::response(response::SESSION_NOT_OPEN, tid, &[])],
                }
            }
            op::GET_STORAGE_IDS | op::GET_STORAGE_INFO if self.session.lock().is_none() => {
                vec![Container::response(response::SESSION_NOT_OPEN, tid, &[])]
            }
            op::GET_STORAGE_IDS => {
                let ids: Vec<u32> = self.storage_ids().iter().map(|id| id.as_raw()).collect();
                let payload = Dataset::new().u32_array(&ids).finish();
                vec![
                    Container::data(request.code, tid, payload),
                    Container::response(response::OK, tid, &[]),
                ]
            }
            op::GET_STORAGE_INFO => self.storage_info(request),
            code => {
                debug!("Operation 0x{:04x} not supported", code);
                vec![Container::response(
                    response::OPERATION_NOT_SUPPORTED,
                    tid,
                    &[],
                )]
            }
        }
    }

    fn open_session(&self, request: &Container) -> Container {
        let tid = request.transaction_id;
        let requested = request.param(0);
        if requested == 0 {
            return Container::response(response::INVALID_PARAMETER, tid, &[]);
        }

        let mut session = self.session.lock();
        match *session {
            Some(current) => Container::response(response::SESSION_ALREADY_OPEN, tid, &[current]),
            None => {
                *session = Some(requested);
                info!("Host opened session {}", requested);
                Container::response(response::OK, tid, &[])
            }
        }
    }

    fn storage_info(&self, request: &Container) -> Vec<Container> {
        let tid = request.transaction_id;
        let id = StorageId(request.param(0));

        let Some(storage) = self.storages.read().get(&id).cloned() else {
            return vec![Container::response(response::INVALID_STORAGE_ID, tid, &[])];
        };

        let (capacity, free) = match capacity(&storage.path, storage.reserve_space) {
            Ok(space) => space,
            Err(e) => {
                warn!("Failed to stat storage {}: {}", storage.path.display(), e);
                return vec![Container::response(response::GENERAL_ERROR, tid, &[])];
            }
        };

        let storage_type = match storage.kind {
            StorageKind::Fixed => STORAGE_TYPE_FIXED_RAM,
            StorageKind::Removable => STORAGE_TYPE_REMOVABLE_RAM,
        };
        let volume_id = storage
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let payload = Dataset::new()
            .u16(storage_type)
            .u16(FILESYSTEM_GENERIC_HIERARCHICAL)
            .u16(ACCESS_READ_WRITE)
            .u64(capacity)
            .u64(free)
            .u32(FREE_OBJECTS_UNKNOWN)
            .string(&storage.description)
            .string(volume_id)
            .finish();

        vec![
            Container::data(request.code, tid, payload),
            Container::response(response::OK, tid, &[]),
        ]
    }

    fn send(&self, containers: &[Container]) -> Result<()> {
        let mut transport = &self.transport;
        for container in containers {
            transport
                .write_all(&container.encode())
                .context(TransportIoSnafu)?;
        }
        Ok(())
    }

    fn serve_one(&self, buf: &mut [u8]) -> Result<()> {
        let read = (&self.transport).read(buf).context(TransportIoSnafu)?;
        if read == 0 {
            return Err(Error::TransportIo {
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed"),
            });
        }

        match Container::parse(&buf[..read]) {
            Ok(request) => self.send(&self.handle(&request)),
            Err(e) => {
                debug!("Skipping container: {}", e);
                Ok(())
            }
        }
    }
}

/// Total and available bytes of the filesystem holding `path`, with
/// `reserve` bytes withheld from the available space.
fn capacity(path: &Path, reserve: u64) -> std::result::Result<(u64, u64), Errno> {
    let stat = statvfs(path)?;
    let block = u64::from(stat.fragment_size());
    let total = u64::from(stat.blocks()) * block;
    let available = u64::from(stat.blocks_available()) * block;
    Ok((total, available.saturating_sub(reserve)))
}

impl ProtocolEngine for MtpResponder {
    fn add_storage(&self, storage: &StorageDescriptor) -> Result<()> {
        let mut storages = self.storages.write();
        if storages.insert(storage.id, storage.clone()).is_some() {
            warn!("Storage {} was already advertised, replaced", storage.id);
        }
        info!(
            "Advertising storage {} '{}' at {}",
            storage.id,
            storage.description,
            storage.path.display()
        );
        Ok(())
    }

    fn remove_storage(&self, id: StorageId) -> Result<()> {
        match self.storages.write().remove(&id) {
            Some(storage) => {
                info!("Withdrew storage {} '{}'", id, storage.description);
                Ok(())
            }
            None => Err(Error::UnknownStorage { id }),
        }
    }

    fn run(&self) -> Result<()> {
        info!(
            "Serving MTP (group {}, file mode {:o}, directory mode {:o})",
            self.policy.group, self.policy.file_mode, self.policy.directory_mode
        );

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;

        while !self.stopped.load(Ordering::SeqCst) {
            let (transport_ready, woken) = {
                let mut fds = [
                    PollFd::new(self.transport.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).context(TransportPollSnafu),
                }
                let is_ready = |fd: &PollFd| fd.revents().is_some_and(|r| r.intersects(ready));
                (is_ready(&fds[0]), is_ready(&fds[1]))
            };

            if woken {
                let mut byte = [0u8; 1];
                if let Err(e) = (&self.wake_rx).read(&mut byte) {
                    warn!("Failed to drain wake pipe: {}", e);
                }
                continue;
            }

            if transport_ready {
                self.serve_one(&mut buf)?;
            }
        }

        info!("MTP serving loop stopped");
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = (&self.wake_tx).write_all(&[1]) {
            warn!("Failed to wake serving loop: {}", e);
        }
    }
}

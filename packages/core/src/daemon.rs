//! Daemon lifecycle.
//!
//! [`Daemon::start`] wires the synchronizer to its event sources: it tracks
//! the home directory, scans the media root, starts the volume thread, reads
//! the session lock state and runs the first reconciliation. [`Daemon::run`]
//! then blocks in the protocol engine until it is stopped, and
//! [`Daemon::shutdown`] stops every context and releases all storage.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use snafu::{Report, ResultExt};

use crate::config::Settings;
use crate::engine::{MetadataIndex, ProtocolEngine};
use crate::error::{Error, Result, ThreadSpawnSnafu};
use crate::session::{LockMonitor, LockSubscription, SessionHandle};
use crate::sync::{LockState, Snapshot, Synchronizer};
use crate::watcher::{StopHandle, Volume, VolumeEvent, VolumeWatcher};

/// Where the initial lock state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSetup {
    /// Track the logind session attached to `terminal`.
    Logind { terminal: String },
    /// Use a fixed lock state and never track a session.
    Fixed(LockState),
}

impl SessionSetup {
    /// Setup matching the resolved settings.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.track_session_lock {
            Self::Logind {
                terminal: settings.session_terminal.clone(),
            }
        } else {
            Self::Fixed(LockState::Unlocked)
        }
    }
}

/// A started daemon.
pub struct Daemon {
    sync: Arc<Synchronizer>,
    engine: Arc<dyn ProtocolEngine>,
    volume_stop: Option<StopHandle>,
    volume_thread: Option<JoinHandle<()>>,
    watcher_failure: Arc<Mutex<Option<Error>>>,
    lock_subscription: Option<LockSubscription>,
    torn_down: bool,
}

impl Daemon {
    /// Brings every context up and exposes storage according to the
    /// current lock state.
    pub fn start(
        settings: &Settings,
        session: SessionSetup,
        engine: Arc<dyn ProtocolEngine>,
        index: Arc<dyn MetadataIndex>,
    ) -> Result<Self> {
        let sync = Arc::new(Synchronizer::new(
            engine.clone(),
            index,
            settings.storage_limits(),
        ));
        sync.register_home(&settings.home_path, &settings.home_label);

        let mut watcher = VolumeWatcher::new(&settings.media_root)?;
        for volume in initial_volumes(&mut watcher) {
            if let Err(e) = sync.on_volume_appeared(&volume.path, &volume.name) {
                warn!("{}", Report::from_error(&e));
            }
        }

        let watcher_failure = Arc::new(Mutex::new(None));
        let volume_stop = watcher.stop_handle();
        let volume_thread = spawn_volume_thread(
            watcher,
            sync.clone(),
            engine.clone(),
            watcher_failure.clone(),
        )?;

        let mut daemon = Self {
            sync,
            engine,
            volume_stop: Some(volume_stop),
            volume_thread: Some(volume_thread),
            watcher_failure,
            lock_subscription: None,
            torn_down: false,
        };

        let tracked = match session {
            SessionSetup::Fixed(lock_state) => {
                info!("Session lock tracking disabled, assuming {:?}", lock_state);
                daemon.sync.set_initial_lock_state(lock_state);
                None
            }
            SessionSetup::Logind { terminal } => match connect_session(&terminal) {
                Ok(Some((monitor, session, locked))) => {
                    daemon
                        .sync
                        .set_initial_lock_state(LockState::from_locked(locked));
                    Some((monitor, session))
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(
                        "Session lock tracking unavailable, storage stays hidden: {}",
                        Report::from_error(&e)
                    );
                    None
                }
            },
        };

        info!("Initial lock state: {:?}", daemon.sync.lock_state());
        if let Err(e) = daemon.sync.reconcile() {
            warn!("{}", Report::from_error(&e));
        }

        if let Some((monitor, session)) = tracked {
            let sync = daemon.sync.clone();
            let subscribed = monitor.subscribe(&session, move |locked| {
                if let Err(e) = sync.on_lock_changed(locked) {
                    warn!("{}", Report::from_error(&e));
                }
            });
            match subscribed {
                Ok(subscription) => daemon.lock_subscription = Some(subscription),
                Err(e) => warn!(
                    "Lock changes of session {} will be missed: {}",
                    session.id,
                    Report::from_error(&e)
                ),
            }
        }

        Ok(daemon)
    }

    /// Serves the transport on the calling thread until the engine stops.
    ///
    /// Returns the watcher failure if that is what stopped the engine.
    pub fn run(&self) -> Result<()> {
        self.engine.run()?;
        match self.watcher_failure.lock().take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Asks [`Daemon::run`] to return.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Returns the current lock state and entries.
    pub fn snapshot(&self) -> Snapshot {
        self.sync.snapshot()
    }

    /// Stops every context, then hides and forgets all storage.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        if let Some(stop) = self.volume_stop.take() {
            stop.stop();
        }
        if let Some(thread) = self.volume_thread.take()
            && thread.join().is_err()
        {
            error!("Volume thread panicked");
        }

        if let Some(subscription) = self.lock_subscription.take()
            && let Err(e) = subscription.stop()
        {
            warn!("{}", Report::from_error(&e));
        }

        info!("Releasing all storage");
        self.sync.teardown()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", Report::from_error(&e));
        }
    }
}

/// Volumes mounted before the watch started. A root that cannot be read is
/// treated as empty; its volumes show up through later events or a rescan.
fn initial_volumes(watcher: &mut VolumeWatcher) -> Vec<Volume> {
    watcher.scan_existing().unwrap_or_else(|e| {
        warn!(
            "Starting without existing volumes: {}",
            Report::from_error(&e)
        );
        Vec::new()
    })
}

fn spawn_volume_thread(
    watcher: VolumeWatcher,
    sync: Arc<Synchronizer>,
    engine: Arc<dyn ProtocolEngine>,
    failure: Arc<Mutex<Option<Error>>>,
) -> Result<JoinHandle<()>> {
    let root = watcher.root().to_path_buf();
    thread::Builder::new()
        .name("volume-watcher".to_string())
        .spawn(move || {
            debug!("Watching {} for volumes", root.display());
            for event in watcher {
                let outcome = match event {
                    Ok(VolumeEvent::Appeared(volume)) => {
                        sync.on_volume_appeared(&volume.path, &volume.name)
                    }
                    Ok(VolumeEvent::Removed(name)) => sync.on_volume_removed(&name),
                    Err(e) => {
                        error!("{}", Report::from_error(&e));
                        *failure.lock() = Some(e);
                        engine.stop();
                        break;
                    }
                };
                if let Err(e) = outcome {
                    warn!("{}", Report::from_error(&e));
                }
            }
            debug!("Volume thread finished");
        })
        .context(ThreadSpawnSnafu {
            name: "volume-watcher",
        })
}

/// Connects to logind and reads the lock state of the session on `terminal`.
fn connect_session(terminal: &str) -> Result<Option<(LockMonitor, SessionHandle, bool)>> {
    let monitor = LockMonitor::connect()?;
    let Some(session) = monitor.discover_session(terminal)? else {
        return Ok(None);
    };
    let locked = monitor.read_initial_state(&session)?;
    Ok(Some((monitor, session, locked)))
}

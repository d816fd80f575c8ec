//! Daemon mode.
//!
//! Acquires the gadget transport, starts the storage lifecycle and serves
//! until SIGINT or SIGTERM.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{error, info};
use mtp_server_core::error::Error;
use mtp_server_core::{
    CatalogIndex, Daemon, MtpResponder, ProtocolEngine, Result, SessionSetup, Settings, Transport,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use signal_hook::iterator::Signals;
use snafu::ResultExt;

/// Runs the daemon until a termination signal arrives or serving fails.
pub fn run_daemon(settings: &Settings) -> Result<()> {
    // Covers the transport wait, before the serving loop can be stopped
    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, terminate.clone())
            .whatever_context::<_, Error>("failed to register signal handler")?;
    }

    let transport = match Transport::acquire(
        &settings.transport_path,
        settings.transport_retry(),
        &terminate,
    ) {
        Ok(transport) => transport,
        Err(Error::TransportInterrupted { .. }) => {
            info!("Shutdown requested before the transport appeared");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let engine = Arc::new(MtpResponder::new(
        transport.into_file(),
        settings.file_policy(),
    )?);
    let index = Arc::new(CatalogIndex::new());
    let daemon = Daemon::start(
        settings,
        SessionSetup::from_settings(settings),
        engine.clone(),
        index,
    )?;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .whatever_context::<_, Error>("failed to listen for signals")?;
    let signals_handle = signals.handle();
    let signal_thread = {
        let engine = engine.clone();
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {}, shutting down", signal);
                engine.stop();
            }
        })
    };
    if terminate.load(Ordering::SeqCst) {
        engine.stop();
    }

    let served = daemon.run();

    signals_handle.close();
    if signal_thread.join().is_err() {
        error!("Signal thread panicked");
    }

    let released = daemon.shutdown();
    served.and(released)
}

//! Probe mode: reports what the daemon would see, without serving.

use mtp_server_core::session::{DEFAULT_SESSION_TERMINAL, LockMonitor};
use mtp_server_core::watcher::list_volumes;
use mtp_server_core::{Error, LockState, Result, Settings};
use snafu::{Report, ResultExt};

pub fn run_probe(settings: &Settings) -> Result<()> {
    let rendered = serde_json::to_string_pretty(settings)
        .whatever_context::<_, Error>("failed to render settings")?;
    println!("Configuration:\n{}", rendered);

    println!();
    if settings.track_session_lock {
        probe_session(&settings.session_terminal);
    } else {
        println!("Session lock tracking disabled");
    }

    println!();
    println!("Volumes under {}:", settings.media_root.display());
    match list_volumes(&settings.media_root) {
        Ok(volumes) if volumes.is_empty() => println!("  (none)"),
        Ok(volumes) => {
            for volume in volumes {
                println!("  {}  {}", volume.name, volume.path.display());
            }
        }
        Err(e) => println!("  unavailable: {}", Report::from_error(&e)),
    }

    Ok(())
}

fn probe_session(terminal: &str) {
    let monitor = match LockMonitor::connect() {
        Ok(monitor) => monitor,
        Err(e) => {
            println!("System bus unavailable: {}", Report::from_error(&e));
            return;
        }
    };

    match monitor.sessions() {
        Ok(sessions) => {
            println!("Sessions:");
            for session in &sessions {
                let tty = if session.tty.is_empty() { "-" } else { &session.tty };
                println!("  {}  {}  {}", session.id, tty, session.path.as_str());
            }
        }
        Err(e) => {
            println!("Cannot list sessions: {}", Report::from_error(&e));
            return;
        }
    }

    let session = match monitor.discover_session(terminal) {
        Ok(Some(session)) => session,
        Ok(None) => {
            let hint = if terminal == DEFAULT_SESSION_TERMINAL {
                String::new()
            } else {
                format!(" (default is {})", DEFAULT_SESSION_TERMINAL)
            };
            println!("No session on {}{}, storage would stay hidden", terminal, hint);
            return;
        }
        Err(e) => {
            println!("Session discovery failed: {}", Report::from_error(&e));
            return;
        }
    };

    match monitor.read_initial_state(&session) {
        Ok(locked) => println!(
            "Tracked session {} is {:?}",
            session.id,
            LockState::from_locked(locked)
        ),
        Err(e) => println!("Cannot read lock state: {}", Report::from_error(&e)),
    }
}

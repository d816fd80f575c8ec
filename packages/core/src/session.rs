//! Session lock monitoring through systemd-logind.
//!
//! This module finds the interactive session bound to the physical display,
//! reads its `LockedHint` property and reports every change of it. All bus
//! traffic runs on a single-threaded tokio runtime owned by the monitor, which
//! moves onto a dedicated thread once a subscription is started.

use std::pin::pin;
use std::thread::{self, JoinHandle};

use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use snafu::ResultExt;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, proxy};

use crate::error::{BusResultExt, Error, Result, SessionRuntimeSnafu, ThreadSpawnSnafu};

/// Terminal of the graphical session on the physical display.
pub const DEFAULT_SESSION_TERMINAL: &str = "tty7";

/// One entry of `ListSessionsEx`: id, uid, user, seat, leader, class, tty,
/// idle, idle-since, object path.
type SessionRecordEx = (
    String,
    u32,
    String,
    String,
    u32,
    String,
    String,
    bool,
    u64,
    OwnedObjectPath,
);

#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    gen_blocking = false
)]
trait Login1Manager {
    #[zbus(name = "ListSessionsEx")]
    fn list_sessions_ex(&self) -> zbus::Result<Vec<SessionRecordEx>>;

    fn list_sessions(&self) -> zbus::Result<Vec<(String, u32, String, String, OwnedObjectPath)>>;
}

#[proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1",
    gen_blocking = false
)]
trait Login1Session {
    #[zbus(property)]
    fn locked_hint(&self) -> zbus::Result<bool>;

    #[zbus(property, name = "TTY")]
    fn tty(&self) -> zbus::Result<String>;
}

/// A logind session as listed by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub tty: String,
    pub path: OwnedObjectPath,
}

/// The session whose lock state is tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub path: OwnedObjectPath,
}

/// Picks the first session attached to `terminal`.
pub fn select_session(sessions: &[SessionInfo], terminal: &str) -> Option<SessionHandle> {
    sessions
        .iter()
        .find(|s| s.tty == terminal)
        .map(|s| SessionHandle {
            id: s.id.clone(),
            path: s.path.clone(),
        })
}

/// Connection to logind on the system bus.
pub struct LockMonitor {
    runtime: Runtime,
    connection: Connection,
}

impl LockMonitor {
    /// Connects to the system bus.
    pub fn connect() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context(SessionRuntimeSnafu)?;
        let connection = runtime
            .block_on(Connection::system())
            .bus_context("connect to system bus")?;

        Ok(Self {
            runtime,
            connection,
        })
    }

    /// Lists every session known to logind.
    pub fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.runtime.block_on(list_sessions(&self.connection))
    }

    /// Finds the session on `terminal`. `None` if no session matches.
    pub fn discover_session(&self, terminal: &str) -> Result<Option<SessionHandle>> {
        let sessions = self.sessions()?;
        let session = select_session(&sessions, terminal);
        match &session {
            Some(s) => info!("Tracking lock state of session {} on {}", s.id, terminal),
            None => warn!(
                "No session on {} among {} sessions, lock tracking disabled",
                terminal,
                sessions.len()
            ),
        }
        Ok(session)
    }

    /// Reads the current `LockedHint` of a session.
    pub fn read_initial_state(&self, session: &SessionHandle) -> Result<bool> {
        self.runtime.block_on(async {
            let proxy = session_proxy(&self.connection, &session.path).await?;
            proxy
                .locked_hint()
                .await
                .bus_context(format!("read LockedHint of session {}", session.id))
        })
    }

    /// Moves the monitor onto its own thread and calls `on_change` with every
    /// `LockedHint` value reported for `session`.
    ///
    /// The current value is reported once right after subscribing, so a
    /// transition between [`LockMonitor::read_initial_state`] and this call
    /// is not lost; `on_change` must tolerate repeated values.
    pub fn subscribe<F>(self, session: &SessionHandle, on_change: F) -> Result<LockSubscription>
    where
        F: Fn(bool) + Send + 'static,
    {
        let Self {
            runtime,
            connection,
        } = self;
        let proxy = runtime.block_on(session_proxy(&connection, &session.path))?;
        let (stop_tx, stop_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("session-bus".to_string())
            .spawn(move || {
                runtime.block_on(watch_lock_state(proxy, on_change, stop_rx));
            })
            .context(ThreadSpawnSnafu {
                name: "session-bus",
            })?;

        Ok(LockSubscription {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// A running lock state subscription. Dropping it stops the subscription.
pub struct LockSubscription {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LockSubscription {
    /// Stops the bus event loop and joins its thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            // The loop may already have ended on its own
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| Error::SessionThread)?;
        }
        Ok(())
    }
}

impl Drop for LockSubscription {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("{}", e);
        }
    }
}

async fn session_proxy(
    connection: &Connection,
    path: &OwnedObjectPath,
) -> Result<Login1SessionProxy<'static>> {
    Login1SessionProxy::builder(connection)
        .path(path.clone())
        .bus_context(format!("address session {}", path.as_str()))?
        .build()
        .await
        .bus_context(format!("create proxy for session {}", path.as_str()))
}

async fn list_sessions(connection: &Connection) -> Result<Vec<SessionInfo>> {
    let manager = Login1ManagerProxy::new(connection)
        .await
        .bus_context("create login1 manager proxy")?;

    match manager.list_sessions_ex().await {
        Ok(records) => Ok(records
            .into_iter()
            .map(|(id, _, _, _, _, _, tty, _, _, path)| SessionInfo { id, tty, path })
            .collect()),
        Err(e) => {
            debug!("ListSessionsEx unavailable ({}), using ListSessions", e);
            let records = manager
                .list_sessions()
                .await
                .bus_context("list login1 sessions")?;

            let mut sessions = Vec::with_capacity(records.len());
            for (id, _, _, _, path) in records {
                let proxy = session_proxy(connection, &path).await?;
                let tty = proxy.tty().await.unwrap_or_else(|e| {
                    debug!("Session {} has no readable TTY: {}", id, e);
                    String::new()
                });
                sessions.push(SessionInfo { id, tty, path });
            }
            Ok(sessions)
        }
    }
}

async fn watch_lock_state<F>(
    proxy: Login1SessionProxy<'static>,
    on_change: F,
    mut stop: oneshot::Receiver<()>,
) where
    F: Fn(bool),
{
    let changes = proxy
        .receive_locked_hint_changed()
        .await
        .filter_map(|change| async move {
            match change.get().await {
                Ok(locked) => Some(locked),
                Err(e) => {
                    warn!("Failed to decode LockedHint change: {}", e);
                    None
                }
            }
        });
    let changes = pin!(changes);

    match proxy.locked_hint().await {
        Ok(locked) => on_change(locked),
        Err(e) => warn!("Failed to read LockedHint: {}", e),
    }

    relay_lock_changes(changes, &on_change, &mut stop).await;
}

/// Reports every value of `changes` until `stop` fires.
///
/// A stream that ends on its own leaves the lock state unknown, so the
/// session is reported locked before returning.
async fn relay_lock_changes<S, F>(mut changes: S, on_change: &F, stop: &mut oneshot::Receiver<()>)
where
    S: Stream<Item = bool> + Unpin,
    F: Fn(bool),
{
    loop {
        tokio::select! {
            _ = &mut *stop => {
                debug!("Session lock monitor stopped");
                return;
            }
            change = changes.next() => match change {
                Some(locked) => {
                    debug!("LockedHint changed to {}", locked);
                    on_change(locked);
                }
                None => {
                    warn!("LockedHint change stream ended, treating session as locked");
                    on_change(true);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::cell::RefCell;

    fn session(id: &str, tty: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            tty: tty.to_string(),
            path: OwnedObjectPath::try_from(format!("/org/freedesktop/login1/session/_3{}", id))
                .unwrap(),
        }
    }

    #[test]
    fn test_select_session_by_terminal() {
        let sessions = vec![session("1", "tty1"), session("2", "tty7"), session("3", "tty7")];

        let selected = select_session(&sessions, DEFAULT_SESSION_TERMINAL).unwrap();
        assert_eq!(selected.id, "2");
        assert_eq!(selected.path.as_str(), "/org/freedesktop/login1/session/_32");
    }

    fn runtime() -> Runtime {
        Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn test_ended_change_stream_reports_locked() {
        let seen = RefCell::new(Vec::new());
        let on_change = |locked: bool| seen.borrow_mut().push(locked);
        let (_stop_tx, mut stop_rx) = oneshot::channel();

        runtime().block_on(relay_lock_changes(
            stream::iter([false, true, false]),
            &on_change,
            &mut stop_rx,
        ));
        assert_eq!(seen.into_inner(), vec![false, true, false, true]);
    }

    #[test]
    fn test_stopped_relay_reports_nothing() {
        let seen = RefCell::new(Vec::new());
        let on_change = |locked: bool| seen.borrow_mut().push(locked);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        stop_tx.send(()).unwrap();

        runtime().block_on(relay_lock_changes(
            stream::pending::<bool>(),
            &on_change,
            &mut stop_rx,
        ));
        assert!(seen.into_inner().is_empty());
    }

    #[test]
    fn test_select_session_no_match() {
        let sessions = vec![session("1", "tty1"), session("4", "")];
        assert!(select_session(&sessions, DEFAULT_SESSION_TERMINAL).is_none());
        assert!(select_session(&[], DEFAULT_SESSION_TERMINAL).is_none());
    }
}

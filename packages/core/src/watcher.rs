//! Volume mount/unmount watcher.
//!
//! Watches the per-user media root (e.g. `/media/<user>`) for child
//! directories appearing and disappearing, which is how the desktop's
//! automounter publishes removable volumes. Events are delivered as an
//! iterator so the caller decides which thread applies them.
//!
//! When the media root does not exist yet, its parent is watched instead and
//! the watch moves to the root as soon as it is created.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use log::{debug, info, warn};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use snafu::ResultExt;

use crate::error::{Error, IoResultExt, Result, WatchSnafu, WatcherInitSnafu};

/// A mounted volume under the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Mount point, `<root>/<name>`.
    pub path: PathBuf,
    /// Directory name, used as the storage label.
    pub name: String,
}

/// A change under the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    Appeared(Volume),
    Removed(String),
}

enum WatchMessage {
    Fs(notify::Result<Event>),
    Stop,
}

/// Ends a [`VolumeWatcher`] stream from another thread.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<WatchMessage>,
}

impl StopHandle {
    /// Requests the stream to end once every event queued so far is yielded.
    pub fn stop(&self) {
        // A closed channel means the stream already ended
        let _ = self.tx.send(WatchMessage::Stop);
    }
}

#[cfg(test)]
impl StopHandle {
    /// Feeds an I/O failure of the event source into the stream.
    pub(crate) fn inject_failure(&self, message: &str) {
        let error = notify::Error::io(std::io::Error::other(message.to_string()));
        let _ = self.tx.send(WatchMessage::Fs(Err(error)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Armed {
    Root,
    Parent,
}

/// Stream of [`VolumeEvent`]s for the immediate children of a media root.
///
/// Yields `Err` once if the event source fails irrecoverably, then ends.
pub struct VolumeWatcher {
    root: PathBuf,
    parent: PathBuf,
    watcher: RecommendedWatcher,
    rx: Receiver<WatchMessage>,
    tx: Sender<WatchMessage>,
    armed: Armed,
    known: BTreeSet<String>,
    pending: VecDeque<VolumeEvent>,
    failure: Option<Error>,
    finished: bool,
}

impl VolumeWatcher {
    /// Arms a watch on `root`, or on its parent when `root` does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let parent = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let (tx, rx) = mpsc::channel();
        let handler_tx = tx.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = handler_tx.send(WatchMessage::Fs(result));
        })
        .context(WatcherInitSnafu)?;

        let mut volume_watcher = Self {
            root,
            parent,
            watcher,
            rx,
            tx,
            armed: Armed::Parent,
            known: BTreeSet::new(),
            pending: VecDeque::new(),
            failure: None,
            finished: false,
        };
        volume_watcher.arm()?;
        Ok(volume_watcher)
    }

    /// Returns the watched media root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns a handle that ends this stream.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Lists the volumes currently mounted under the root, sorted by name,
    /// and records them as known so later events are not duplicated.
    pub fn scan_existing(&mut self) -> Result<Vec<Volume>> {
        if self.armed != Armed::Root {
            return Ok(Vec::new());
        }

        let volumes = list_volumes(&self.root)?;
        for volume in &volumes {
            self.known.insert(volume.name.clone());
        }
        Ok(volumes)
    }

    fn arm(&mut self) -> Result<()> {
        if self.root.is_dir() {
            return self.watch_root();
        }

        debug!("Adding notify watch for {}", self.parent.display());
        self.watcher
            .watch(&self.parent, RecursiveMode::NonRecursive)
            .context(WatchSnafu {
                path: self.parent.clone(),
            })?;
        self.armed = Armed::Parent;

        // The root may have been created while the parent watch was armed
        if self.root.is_dir() {
            self.watch_root()?;
            self.rescan();
        }
        Ok(())
    }

    fn watch_root(&mut self) -> Result<()> {
        debug!("Adding notify watch for {}", self.root.display());
        self.watcher
            .watch(&self.root, RecursiveMode::NonRecursive)
            .context(WatchSnafu {
                path: self.root.clone(),
            })?;

        if self.armed == Armed::Parent
            && let Err(e) = self.watcher.unwatch(&self.parent)
        {
            debug!("Parent watch already gone: {}", e);
        }
        self.armed = Armed::Root;
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        if event.need_rescan() {
            debug!("Event queue overflowed, rescanning {}", self.root.display());
            self.rescan();
            return Ok(());
        }

        if self.armed == Armed::Parent {
            let root_created = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            ) && event.paths.iter().any(|p| p == &self.root);

            if root_created {
                info!("media root {} was created", self.root.display());
                self.watch_root()?;
                self.rescan();
            }
            return Ok(());
        }

        if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind
            && let [from, to] = event.paths.as_slice()
        {
            self.removed(from);
            self.appeared(to);
            return Ok(());
        }

        for path in &event.paths {
            if path == &self.root {
                if matches!(
                    event.kind,
                    EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
                ) {
                    self.root_removed()?;
                    return Ok(());
                }
                continue;
            }

            match event.kind {
                EventKind::Create(CreateKind::File) => {
                    debug!("Ignoring non-directory {}", path.display());
                }
                EventKind::Create(CreateKind::Folder) => self.appeared(path),
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    if path.is_dir() {
                        self.appeared(path);
                    }
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    self.removed(path)
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_error(&mut self, error: notify::Error) -> Result<()> {
        match error.kind {
            notify::ErrorKind::Io(_) | notify::ErrorKind::MaxFilesWatch => {
                Err(Error::WatcherFailed {
                    message: error.to_string(),
                })
            }
            _ => {
                warn!("Skipping unreadable filesystem event: {}", error);
                Ok(())
            }
        }
    }

    fn appeared(&mut self, path: &Path) {
        let Some(name) = self.child_name(path) else {
            return;
        };
        if self.known.insert(name.clone()) {
            self.pending.push_back(VolumeEvent::Appeared(Volume {
                path: path.to_path_buf(),
                name,
            }));
        }
    }

    fn removed(&mut self, path: &Path) {
        let Some(name) = self.child_name(path) else {
            return;
        };
        if self.known.remove(&name) {
            self.pending.push_back(VolumeEvent::Removed(name));
        }
    }

    fn child_name(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.root.as_path()) {
            debug!("Skipping event outside media root: {}", path.display());
            return None;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => Some(name.to_string()),
            None => {
                warn!("Skipping volume with unusable name: {}", path.display());
                None
            }
        }
    }

    /// Brings the known set in line with the directory contents.
    fn rescan(&mut self) {
        if self.armed != Armed::Root {
            return;
        }

        let current: BTreeSet<String> = match list_volumes(&self.root) {
            Ok(volumes) => volumes.into_iter().map(|v| v.name).collect(),
            Err(e) => {
                warn!("{}", snafu::Report::from_error(&e));
                return;
            }
        };

        for name in self.known.difference(&current) {
            self.pending.push_back(VolumeEvent::Removed(name.clone()));
        }
        for name in current.difference(&self.known) {
            self.pending.push_back(VolumeEvent::Appeared(Volume {
                path: self.root.join(name),
                name: name.clone(),
            }));
        }
        self.known = current;
    }

    fn root_removed(&mut self) -> Result<()> {
        info!("media root {} was removed", self.root.display());
        for name in std::mem::take(&mut self.known) {
            self.pending.push_back(VolumeEvent::Removed(name));
        }
        if let Err(e) = self.watcher.unwatch(&self.root) {
            debug!("Root watch already gone: {}", e);
        }
        self.arm()?;
        // The root may already be back with volumes in it
        self.rescan();
        Ok(())
    }
}

impl Iterator for VolumeWatcher {
    type Item = Result<VolumeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if let Some(failure) = self.failure.take() {
                self.finished = true;
                return Some(Err(failure));
            }
            if self.finished {
                return None;
            }

            let outcome = match self.rx.recv() {
                Ok(WatchMessage::Fs(Ok(event))) => self.handle_event(event),
                Ok(WatchMessage::Fs(Err(error))) => self.handle_error(error),
                Ok(WatchMessage::Stop) => {
                    debug!("Volume watcher stopped");
                    self.finished = true;
                    Ok(())
                }
                Err(_) => Err(Error::WatcherFailed {
                    message: "event channel closed".to_string(),
                }),
            };

            if let Err(e) = outcome {
                self.failure = Some(e);
            }
        }
    }
}

/// Lists the child directories of `root`, sorted by name.
///
/// Entries that cannot be inspected or have non-UTF-8 names are skipped.
pub fn list_volumes(root: &Path) -> Result<Vec<Volume>> {
    let mut volumes = Vec::new();
    for entry in fs::read_dir(root).scan_context(root)? {
        let Ok(entry) = entry else {
            continue;
        };
        let is_dir = fs::metadata(entry.path())
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => volumes.push(Volume {
                path: entry.path(),
                name,
            }),
            Err(raw) => warn!("Skipping volume with unusable name: {:?}", raw),
        }
    }
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(volumes)
}

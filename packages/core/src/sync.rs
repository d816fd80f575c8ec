//! Exposure synchronization.
//!
//! [`Synchronizer`] is the only writer of the [`Registry`] and the only caller
//! of the add/remove entry points of the protocol engine and metadata index.
//! Volume events, lock transitions and the startup reconciliation all go
//! through one mutex that covers "mutate state, then call the engine", so a
//! lock change racing a hot-plug event always leaves the engine in agreement
//! with the registry.
//!
//! After every operation each entry satisfies
//! `exposed == tracked && lock_state == Unlocked`, unless exposing it failed,
//! in which case it stays tracked and hidden and the failure is returned.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use snafu::{Report, ResultExt};

use crate::engine::{MetadataIndex, ProtocolEngine};
use crate::error::{Error, ExposeSnafu, Result};
use crate::storage::{EntryKey, Registry, StorageEntry, StorageLimits};

/// Screen lock state of the interactive session.
///
/// Defaults to `Locked`: without a session to track, storage stays hidden.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Locked,
    Unlocked,
}

impl LockState {
    /// Converts a logind `LockedHint` value.
    pub fn from_locked(locked: bool) -> Self {
        if locked { Self::Locked } else { Self::Unlocked }
    }

    /// Returns true for `Locked`.
    pub fn is_locked(self) -> bool {
        self == Self::Locked
    }
}

/// Point-in-time copy of the synchronizer state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub lock_state: LockState,
    pub entries: Vec<StorageEntry>,
}

struct SyncState {
    lock_state: LockState,
    registry: Registry,
}

/// Keeps engine exposure consistent with mount presence and lock state.
pub struct Synchronizer {
    state: Mutex<SyncState>,
    engine: Arc<dyn ProtocolEngine>,
    index: Arc<dyn MetadataIndex>,
}

impl Synchronizer {
    /// Creates a synchronizer with an empty registry and the default lock state.
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        index: Arc<dyn MetadataIndex>,
        limits: StorageLimits,
    ) -> Self {
        Self {
            state: Mutex::new(SyncState {
                lock_state: LockState::default(),
                registry: Registry::new(limits),
            }),
            engine,
            index,
        }
    }

    /// Tracks the home directory. It is not exposed until reconciliation.
    pub fn register_home(&self, path: &Path, label: &str) {
        let mut state = self.state.lock();
        state.registry.insert_home(path, label);
        info!("Tracking home storage '{}' at {}", label, path.display());
    }

    /// Sets the lock state read at startup without touching any entry.
    pub fn set_initial_lock_state(&self, lock_state: LockState) {
        self.state.lock().lock_state = lock_state;
    }

    /// Returns the current lock state.
    pub fn lock_state(&self) -> LockState {
        self.state.lock().lock_state
    }

    /// Returns a copy of the lock state and every tracked entry.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            lock_state: state.lock_state,
            entries: state.registry.all_entries().cloned().collect(),
        }
    }

    /// Handles a volume mounted under the media root.
    ///
    /// A previous entry with the same name is torn down first.
    pub fn on_volume_appeared(&self, path: &Path, name: &str) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(previous) = state.registry.remove_removable(name)
            && previous.is_exposed()
        {
            debug!("Replacing exposed storage '{}' ({})", name, previous.id());
            if let Err(e) = self.hide(&previous) {
                warn!("{}", Report::from_error(&e));
            }
        }

        state.registry.upsert_removable(name, path);
        info!("Storage was added: {} at {}", name, path.display());

        if state.lock_state == LockState::Unlocked {
            let key = EntryKey::Removable(name.to_string());
            self.expose(&mut state.registry, &key)?;
        }

        Ok(())
    }

    /// Handles a volume disappearing from the media root.
    ///
    /// Unknown names are ignored, so duplicate removal events are harmless.
    pub fn on_volume_removed(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();

        let Some(entry) = state.registry.remove_removable(name) else {
            debug!("Ignoring removal of untracked storage '{}'", name);
            return Ok(());
        };

        info!("Storage was removed: {}", name);
        if entry.is_exposed() {
            self.hide(&entry)?;
        }

        Ok(())
    }

    /// Handles a screen lock transition.
    ///
    /// Unlocking exposes every hidden entry, locking hides every exposed entry
    /// but keeps it tracked. Repeating the current state does nothing.
    pub fn on_lock_changed(&self, locked: bool) -> Result<()> {
        let lock_state = LockState::from_locked(locked);
        let mut state = self.state.lock();

        if state.lock_state == lock_state {
            debug!("Lock state unchanged ({:?})", lock_state);
            return Ok(());
        }

        state.lock_state = lock_state;
        match lock_state {
            LockState::Unlocked => info!("Screen unlocked, adding storage"),
            LockState::Locked => info!("Screen locked, removing storage"),
        }

        self.apply(&mut state)
    }

    /// Applies the current lock state to every entry.
    pub fn reconcile(&self) -> Result<()> {
        let mut state = self.state.lock();
        debug!("Reconciling storage for {:?}", state.lock_state);
        self.apply(&mut state)
    }

    /// Hides and forgets every entry. Used once at shutdown.
    pub fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut failed = Vec::new();

        for entry in state.registry.drain() {
            if entry.is_exposed()
                && let Err(e) = self.hide(&entry)
            {
                warn!("{}", Report::from_error(&e));
                failed.push(entry.name().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Reconcile { names: failed })
        }
    }

    fn apply(&self, state: &mut SyncState) -> Result<()> {
        let mut failed = Vec::new();

        for key in state.registry.keys() {
            let Some(entry) = state.registry.get(&key) else {
                continue;
            };

            let outcome = match (state.lock_state, entry.is_exposed()) {
                (LockState::Unlocked, false) => self.expose(&mut state.registry, &key),
                (LockState::Locked, true) => {
                    let entry = entry.clone();
                    state.registry.set_exposed(&key, false);
                    self.hide(&entry)
                }
                _ => Ok(()),
            };

            if let Err(e) = outcome {
                warn!("{}", Report::from_error(&e));
                if let Some(entry) = state.registry.get(&key) {
                    failed.push(entry.name().to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Reconcile { names: failed })
        }
    }

    /// Registers an entry with the index and then the engine.
    ///
    /// The exposed flag is only set once both succeeded; an engine failure
    /// rolls back the index registration.
    fn expose(&self, registry: &mut Registry, key: &EntryKey) -> Result<()> {
        let Some(entry) = registry.get(key) else {
            return Ok(());
        };
        if entry.is_exposed() {
            return Ok(());
        }

        let name = entry.name().to_string();
        let storage = entry.descriptor();

        self.index
            .add_storage_path(
                &storage.path,
                "",
                storage.id,
                storage.kind.scan_recursively(),
            )
            .context(ExposeSnafu { name: name.clone() })?;

        if let Err(e) = self.engine.add_storage(&storage) {
            if let Err(rollback) = self.index.remove_storage(storage.id) {
                warn!(
                    "Failed to roll back index for storage {}: {}",
                    storage.id,
                    Report::from_error(&rollback)
                );
            }
            return Err(Error::Expose {
                name,
                source: Box::new(e),
            });
        }

        registry.set_exposed(key, true);
        debug!("Exposed storage '{}' as {}", name, storage.id);
        Ok(())
    }

    /// Releases an entry from the engine and then the index.
    ///
    /// Both removals are attempted; the first failure is reported.
    fn hide(&self, entry: &StorageEntry) -> Result<()> {
        let id = entry.id();
        debug!("removing storage id {}", id);

        let engine_result = self.engine.remove_storage(id);
        let index_result = self.index.remove_storage(id);

        engine_result
            .and(index_result)
            .map_err(|e| Error::Hide {
                name: entry.name().to_string(),
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HOME_STORAGE_ID, StorageId, StorageKind};
    use crate::testing::{EngineCall, RecordingEngine, RecordingIndex};
    use std::path::PathBuf;

    fn synchronizer() -> (Synchronizer, Arc<RecordingEngine>, Arc<RecordingIndex>) {
        let engine = Arc::new(RecordingEngine::default());
        let index = Arc::new(RecordingIndex::default());
        let sync = Synchronizer::new(engine.clone(), index.clone(), StorageLimits::default());
        sync.register_home(Path::new("/home/user"), "Phone");
        (sync, engine, index)
    }

    fn media(name: &str) -> PathBuf {
        PathBuf::from("/media/user").join(name)
    }

    /// Every entry must be exposed exactly when the session is unlocked, and
    /// the engine must advertise exactly the exposed entries.
    fn assert_invariant(sync: &Synchronizer, engine: &RecordingEngine) {
        let snapshot = sync.snapshot();
        let unlocked = snapshot.lock_state == LockState::Unlocked;
        for entry in &snapshot.entries {
            assert_eq!(entry.is_exposed(), unlocked, "entry {}", entry.name());
        }

        let mut exposed: Vec<StorageId> = snapshot
            .entries
            .iter()
            .filter(|e| e.is_exposed())
            .map(|e| e.id())
            .collect();
        exposed.sort();
        assert_eq!(engine.advertised_ids(), exposed);
    }

    fn entry<'a>(snapshot: &'a Snapshot, name: &str) -> Option<&'a StorageEntry> {
        snapshot.entries.iter().find(|e| e.name() == name)
    }

    #[test]
    fn test_lock_state_default_is_locked() {
        assert_eq!(LockState::default(), LockState::Locked);
        assert!(LockState::from_locked(true).is_locked());
        assert!(!LockState::from_locked(false).is_locked());
    }

    #[test]
    fn test_startup_unlocked_exposes_each_entry_once() {
        let (sync, engine, index) = synchronizer();
        sync.on_volume_appeared(&media("SDCARD1"), "SDCARD1").unwrap();
        assert!(engine.calls().is_empty());

        sync.set_initial_lock_state(LockState::Unlocked);
        sync.reconcile().unwrap();

        let adds = engine.added_descriptions();
        assert_eq!(adds, vec!["Phone", "SDCARD1"]);
        assert_eq!(adds.iter().filter(|d| *d == "SDCARD1").count(), 1);
        assert_eq!(index.indexed_paths().len(), 2);
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_startup_locked_then_unlock() {
        let (sync, engine, _index) = synchronizer();
        sync.on_volume_appeared(&media("SDCARD1"), "SDCARD1").unwrap();
        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();

        sync.set_initial_lock_state(LockState::Locked);
        sync.reconcile().unwrap();
        assert!(engine.calls().is_empty());
        assert_eq!(sync.snapshot().entries.len(), 3);

        sync.on_lock_changed(false).unwrap();
        assert_eq!(engine.added_descriptions(), vec!["Phone", "SDCARD1", "USB1"]);
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_appeared_then_removed_while_unlocked() {
        let (sync, engine, index) = synchronizer();
        sync.set_initial_lock_state(LockState::Unlocked);
        sync.reconcile().unwrap();
        engine.clear_calls();

        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        let id = entry(&sync.snapshot(), "USB1").unwrap().id();
        sync.on_volume_removed("USB1").unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Add(id, "USB1".to_string()),
                EngineCall::Remove(id)
            ]
        );
        assert!(entry(&sync.snapshot(), "USB1").is_none());
        assert!(!index.contains(id));
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_appeared_while_locked_stays_hidden() {
        let (sync, engine, _index) = synchronizer();
        sync.reconcile().unwrap();

        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        let snapshot = sync.snapshot();
        let usb = entry(&snapshot, "USB1").unwrap();
        assert!(!usb.is_exposed());
        assert_eq!(usb.kind(), StorageKind::Removable);
        assert!(engine.calls().is_empty());

        sync.on_lock_changed(false).unwrap();
        assert!(entry(&sync.snapshot(), "USB1").unwrap().is_exposed());
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_lock_change_is_idempotent() {
        let (sync, engine, _index) = synchronizer();
        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();

        sync.on_lock_changed(false).unwrap();
        let after_first = engine.calls();
        sync.on_lock_changed(false).unwrap();
        assert_eq!(engine.calls(), after_first);

        sync.on_lock_changed(true).unwrap();
        let after_lock = engine.calls();
        sync.on_lock_changed(true).unwrap();
        assert_eq!(engine.calls(), after_lock);
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_lock_hides_but_keeps_tracking() {
        let (sync, engine, index) = synchronizer();
        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        sync.on_lock_changed(false).unwrap();
        let ids: Vec<StorageId> = sync.snapshot().entries.iter().map(|e| e.id()).collect();

        sync.on_lock_changed(true).unwrap();
        let snapshot = sync.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(engine.advertised_ids().is_empty());
        for id in ids {
            assert!(!index.contains(id));
        }

        // Ids survive a lock cycle
        sync.on_lock_changed(false).unwrap();
        assert!(engine.advertised_ids().contains(&HOME_STORAGE_ID));
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let (sync, engine, _index) = synchronizer();
        sync.on_lock_changed(false).unwrap();
        engine.clear_calls();

        sync.on_volume_removed("GHOST").unwrap();
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_duplicate_removal_is_noop() {
        let (sync, engine, _index) = synchronizer();
        sync.on_lock_changed(false).unwrap();
        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        sync.on_volume_removed("USB1").unwrap();
        let calls = engine.calls();

        sync.on_volume_removed("USB1").unwrap();
        assert_eq!(engine.calls(), calls);
    }

    #[test]
    fn test_appeared_twice_replaces_exposure() {
        let (sync, engine, _index) = synchronizer();
        sync.on_lock_changed(false).unwrap();

        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        let old = entry(&sync.snapshot(), "USB1").unwrap().id();
        engine.clear_calls();

        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        let new = entry(&sync.snapshot(), "USB1").unwrap().id();
        assert_ne!(old, new);

        // The old id is released before the new one is advertised
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Remove(old),
                EngineCall::Add(new, "USB1".to_string())
            ]
        );
        assert_eq!(engine.max_advertised_for("USB1"), 1);
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_engine_failure_leaves_entry_hidden() {
        let (sync, engine, index) = synchronizer();
        engine.fail_path(media("FULL"));
        sync.on_lock_changed(false).unwrap();

        let err = sync.on_volume_appeared(&media("FULL"), "FULL").unwrap_err();
        assert!(matches!(err, Error::Expose { ref name, .. } if name == "FULL"));

        let snapshot = sync.snapshot();
        let full = entry(&snapshot, "FULL").unwrap();
        assert!(!full.is_exposed());
        // Index registration was rolled back
        assert!(!index.contains(full.id()));
        // Other entries are untouched
        assert!(entry(&snapshot, "Phone").unwrap().is_exposed());
    }

    #[test]
    fn test_engine_failure_reported_by_unlock() {
        let (sync, engine, _index) = synchronizer();
        engine.fail_path(media("FULL"));
        sync.on_volume_appeared(&media("FULL"), "FULL").unwrap();
        sync.on_volume_appeared(&media("OK"), "OK").unwrap();

        let err = sync.on_lock_changed(false).unwrap_err();
        match err {
            Error::Reconcile { names } => assert_eq!(names, vec!["FULL".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        let snapshot = sync.snapshot();
        assert!(entry(&snapshot, "OK").unwrap().is_exposed());
        assert!(!entry(&snapshot, "FULL").unwrap().is_exposed());

        // A later reconciliation retries the failed entry
        engine.clear_failures();
        sync.reconcile().unwrap();
        assert_invariant(&sync, &engine);
    }

    #[test]
    fn test_index_failure_skips_engine() {
        let (sync, engine, index) = synchronizer();
        index.fail_path(media("BROKEN"));
        sync.on_lock_changed(false).unwrap();
        engine.clear_calls();

        assert!(sync.on_volume_appeared(&media("BROKEN"), "BROKEN").is_err());
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (sync, engine, index) = synchronizer();
        sync.on_volume_appeared(&media("USB1"), "USB1").unwrap();
        sync.on_lock_changed(false).unwrap();

        sync.teardown().unwrap();
        assert!(sync.snapshot().entries.is_empty());
        assert!(engine.advertised_ids().is_empty());
        assert!(index.indexed_paths().is_empty());
    }

    #[test]
    fn test_concurrent_events_keep_invariant() {
        let (sync, engine, _index) = synchronizer();
        let sync = Arc::new(sync);

        let volumes = {
            let sync = sync.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let name = format!("USB{}", i % 5);
                    sync.on_volume_appeared(&media(&name), &name).unwrap();
                    if i % 3 == 0 {
                        sync.on_volume_removed(&name).unwrap();
                    }
                }
            })
        };
        let locks = {
            let sync = sync.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    sync.on_lock_changed(i % 2 == 0).unwrap();
                }
            })
        };

        volumes.join().unwrap();
        locks.join().unwrap();
        assert_invariant(&sync, &engine);
    }
}

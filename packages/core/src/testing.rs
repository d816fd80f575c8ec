//! Recording fakes for the engine and index seams, shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use snafu::whatever;

use crate::engine::{MetadataIndex, ProtocolEngine};
use crate::error::Result;
use crate::storage::{StorageDescriptor, StorageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Add(StorageId, String),
    Remove(StorageId),
}

#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    advertised: Mutex<BTreeMap<StorageId, StorageDescriptor>>,
    max_per_name: Mutex<HashMap<String, usize>>,
    failing: Mutex<Vec<PathBuf>>,
    stopped: AtomicBool,
}

impl RecordingEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn added_descriptions(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::Add(_, description) => Some(description.clone()),
                EngineCall::Remove(_) => None,
            })
            .collect()
    }

    pub fn advertised_ids(&self) -> Vec<StorageId> {
        self.advertised.lock().keys().copied().collect()
    }

    /// Largest number of simultaneously advertised storages seen for a name.
    pub fn max_advertised_for(&self, description: &str) -> usize {
        self.max_per_name
            .lock()
            .get(description)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_path(&self, path: PathBuf) {
        self.failing.lock().push(path);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ProtocolEngine for RecordingEngine {
    fn add_storage(&self, storage: &StorageDescriptor) -> Result<()> {
        if self.failing.lock().contains(&storage.path) {
            whatever!("no free storage slot for {}", storage.path.display());
        }

        let mut advertised = self.advertised.lock();
        advertised.insert(storage.id, storage.clone());
        let count = advertised
            .values()
            .filter(|s| s.description == storage.description)
            .count();
        let mut max = self.max_per_name.lock();
        let seen = max.entry(storage.description.clone()).or_default();
        *seen = (*seen).max(count);

        self.calls
            .lock()
            .push(EngineCall::Add(storage.id, storage.description.clone()));
        Ok(())
    }

    fn remove_storage(&self, id: StorageId) -> Result<()> {
        self.advertised.lock().remove(&id);
        self.calls.lock().push(EngineCall::Remove(id));
        Ok(())
    }

    fn run(&self) -> Result<()> {
        while !self.stopped.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingIndex {
    storages: Mutex<BTreeMap<StorageId, PathBuf>>,
    failing: Mutex<Vec<PathBuf>>,
}

impl RecordingIndex {
    pub fn contains(&self, id: StorageId) -> bool {
        self.storages.lock().contains_key(&id)
    }

    pub fn indexed_paths(&self) -> Vec<PathBuf> {
        self.storages.lock().values().cloned().collect()
    }

    pub fn fail_path(&self, path: PathBuf) {
        self.failing.lock().push(path);
    }
}

impl MetadataIndex for RecordingIndex {
    fn add_storage_path(
        &self,
        path: &Path,
        _extra: &str,
        id: StorageId,
        _scan_recursively: bool,
    ) -> Result<()> {
        if self.failing.lock().iter().any(|p| p == path) {
            whatever!("cannot index {}", path.display());
        }
        self.storages.lock().insert(id, path.to_path_buf());
        Ok(())
    }

    fn remove_storage(&self, id: StorageId) -> Result<()> {
        self.storages.lock().remove(&id);
        Ok(())
    }
}

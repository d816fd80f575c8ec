//! In-memory object catalog.
//!
//! [`CatalogIndex`] assigns an MTP object handle to every file and directory
//! of a storage, recording the parent link of each object. The home storage
//! is cataloged one level deep; removable storage is walked recursively.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::engine::MetadataIndex;
use crate::error::{Error, Result};
use crate::storage::StorageId;

/// MTP object handle.
pub type ObjectHandle = u32;

/// Parent handle of objects at the top of a storage.
pub const ROOT_PARENT: ObjectHandle = 0;

/// One cataloged file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub handle: ObjectHandle,
    pub parent: ObjectHandle,
    pub storage: StorageId,
    /// Path relative to the storage root.
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug)]
struct StorageCatalog {
    root: PathBuf,
    description: String,
    handles: HashMap<PathBuf, ObjectHandle>,
}

#[derive(Debug)]
struct CatalogState {
    next_handle: ObjectHandle,
    objects: BTreeMap<ObjectHandle, ObjectRecord>,
    storages: HashMap<StorageId, StorageCatalog>,
}

impl CatalogState {
    fn allocate_handle(&mut self) -> ObjectHandle {
        let handle = self.next_handle;
        self.next_handle = match handle.wrapping_add(1) {
            ROOT_PARENT => 1,
            next => next,
        };
        handle
    }

    fn drop_storage(&mut self, id: StorageId) -> Option<StorageCatalog> {
        let catalog = self.storages.remove(&id)?;
        for handle in catalog.handles.values() {
            self.objects.remove(handle);
        }
        Some(catalog)
    }
}

/// Metadata index backed by a directory walk.
#[derive(Debug)]
pub struct CatalogIndex {
    state: Mutex<CatalogState>,
}

impl Default for CatalogIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState {
                next_handle: 1,
                objects: BTreeMap::new(),
                storages: HashMap::new(),
            }),
        }
    }

    /// Number of objects cataloged for storage `id`, 0 if unknown.
    pub fn object_count(&self, id: StorageId) -> usize {
        self.state
            .lock()
            .storages
            .get(&id)
            .map_or(0, |catalog| catalog.handles.len())
    }

    /// Finds an object by its path relative to the storage root.
    pub fn lookup(&self, id: StorageId, path: impl AsRef<Path>) -> Option<ObjectRecord> {
        let state = self.state.lock();
        let handle = state.storages.get(&id)?.handles.get(path.as_ref())?;
        state.objects.get(handle).cloned()
    }

    /// Returns the root path and description override of storage `id`.
    pub fn storage_root(&self, id: StorageId) -> Option<(PathBuf, String)> {
        self.state
            .lock()
            .storages
            .get(&id)
            .map(|catalog| (catalog.root.clone(), catalog.description.clone()))
    }
}

/// An object found by the walk, before handles are assigned.
struct Found {
    path: PathBuf,
    is_dir: bool,
    size: u64,
}

fn walk(root: &Path, id: StorageId, scan_recursively: bool) -> Result<Vec<Found>> {
    let mut walker = WalkDir::new(root).min_depth(1);
    if !scan_recursively {
        walker = walker.max_depth(1);
    }

    let mut found = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(Error::IndexScan {
                    id,
                    path: root.to_path_buf(),
                    source: e,
                });
            }
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let size = entry
            .metadata()
            .map(|m| if m.is_file() { m.len() } else { 0 })
            .unwrap_or(0);

        found.push(Found {
            path: relative.to_path_buf(),
            is_dir: entry.file_type().is_dir(),
            size,
        });
    }
    Ok(found)
}

impl MetadataIndex for CatalogIndex {
    fn add_storage_path(
        &self,
        path: &Path,
        extra: &str,
        id: StorageId,
        scan_recursively: bool,
    ) -> Result<()> {
        // Only the catalog state is unlocked during the walk. Callers such as the
        // synchronizer still hold their own lock, so a large card delays them.
        let found = walk(path, id, scan_recursively)?;

        let mut state = self.state.lock();
        if state.drop_storage(id).is_some() {
            debug!("Re-indexing storage {}", id);
        }

        let mut handles: HashMap<PathBuf, ObjectHandle> = HashMap::with_capacity(found.len());
        for object in found {
            let parent = object
                .path
                .parent()
                .and_then(|p| handles.get(p).copied())
                .unwrap_or(ROOT_PARENT);
            let handle = state.allocate_handle();
            handles.insert(object.path.clone(), handle);
            state.objects.insert(
                handle,
                ObjectRecord {
                    handle,
                    parent,
                    storage: id,
                    path: object.path,
                    is_dir: object.is_dir,
                    size: object.size,
                },
            );
        }

        info!(
            "Indexed {} objects for storage {} at {}",
            handles.len(),
            id,
            path.display()
        );
        state.storages.insert(
            id,
            StorageCatalog {
                root: path.to_path_buf(),
                description: extra.to_string(),
                handles,
            },
        );
        Ok(())
    }

    fn remove_storage(&self, id: StorageId) -> Result<()> {
        if let Some(catalog) = self.state.lock().drop_storage(id) {
            debug!(
                "Dropped {} objects of storage {}",
                catalog.handles.len(),
                id
            );
        }
        Ok(())
    }
}

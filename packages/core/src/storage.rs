//! Storage registry module.
//!
//! The registry is the single owner of every [`StorageEntry`] the daemon knows
//! about: the always-present home entry and one entry per mounted removable
//! volume. It is a plain state container. It never talks to the protocol engine
//! and performs no locking of its own; the synchronizer wraps it in its
//! exclusion region.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Storage id of the fixed home storage.
pub const HOME_STORAGE_ID: StorageId = StorageId(0x0001_0001);

/// Physical storage number of the first removable volume.
const FIRST_REMOVABLE_UNIT: u32 = 2;

/// Space kept free on every storage (100 MiB), so hosts cannot fill the disk.
pub const DEFAULT_RESERVE_SPACE: u64 = 100 * 1024 * 1024;

/// Largest file accepted on removable storage (4 GiB - 1, vfat is assumed).
pub const DEFAULT_REMOVABLE_MAX_FILE_SIZE: u64 = 4_294_967_295;

/// MTP storage id: physical storage number in the high 16 bits, logical
/// partition in the low 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(pub u32);

impl StorageId {
    /// Returns the raw 32-bit id as sent on the wire.
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Kind of storage, mirrored in the storage type reported to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// The user's home directory, present for the daemon's whole lifetime.
    Fixed,
    /// A hot-pluggable volume mounted under the media root.
    Removable,
}

impl StorageKind {
    /// Whether the metadata index should catalog the whole tree up front.
    pub fn scan_recursively(self) -> bool {
        matches!(self, Self::Removable)
    }
}

/// Identifies an entry inside the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKey {
    /// The home entry.
    Home,
    /// A removable entry, keyed by volume name.
    Removable(String),
}

/// Everything the protocol engine needs to advertise a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub id: StorageId,
    pub path: PathBuf,
    pub description: String,
    pub kind: StorageKind,
    /// Bytes kept free; subtracted from the free space reported to hosts.
    pub reserve_space: u64,
    /// Maximum file size accepted, 0 for unchecked. Only engines that accept
    /// object uploads enforce it; [`crate::MtpResponder`] carries it through.
    pub max_file_size: u64,
}

/// A storage tracked by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    id: StorageId,
    path: PathBuf,
    name: String,
    kind: StorageKind,
    exposed: bool,
    reserve_space: u64,
    max_file_size: u64,
}

impl StorageEntry {
    /// Returns the storage id allocated for this entry.
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Returns the filesystem path backing this entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the display label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this is the home or a removable entry.
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Returns true if the entry is currently registered with the protocol engine.
    pub fn is_exposed(&self) -> bool {
        self.exposed
    }

    /// Returns the registry key of this entry.
    pub fn key(&self) -> EntryKey {
        match self.kind {
            StorageKind::Fixed => EntryKey::Home,
            StorageKind::Removable => EntryKey::Removable(self.name.clone()),
        }
    }

    /// Builds the descriptor handed to the protocol engine.
    pub fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor {
            id: self.id,
            path: self.path.clone(),
            description: self.name.clone(),
            kind: self.kind,
            reserve_space: self.reserve_space,
            max_file_size: self.max_file_size,
        }
    }
}

/// Per-kind storage limits applied to newly created entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLimits {
    pub reserve_space: u64,
    pub removable_max_file_size: u64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            reserve_space: DEFAULT_RESERVE_SPACE,
            removable_max_file_size: DEFAULT_REMOVABLE_MAX_FILE_SIZE,
        }
    }
}

/// Authoritative mapping from logical storage to storage entries.
#[derive(Debug)]
pub struct Registry {
    home: Option<StorageEntry>,
    removables: BTreeMap<String, StorageEntry>,
    next_unit: u32,
    limits: StorageLimits,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(StorageLimits::default())
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(limits: StorageLimits) -> Self {
        Self {
            home: None,
            removables: BTreeMap::new(),
            next_unit: FIRST_REMOVABLE_UNIT,
            limits,
        }
    }

    /// Inserts the home entry, unexposed. Replaces any previous home entry.
    pub fn insert_home(&mut self, path: impl Into<PathBuf>, name: impl Into<String>) {
        self.home = Some(StorageEntry {
            id: HOME_STORAGE_ID,
            path: path.into(),
            name: name.into(),
            kind: StorageKind::Fixed,
            exposed: false,
            reserve_space: self.limits.reserve_space,
            max_file_size: 0,
        });
    }

    /// Inserts a new unexposed removable entry with a fresh id.
    ///
    /// Returns the entry previously stored under `name`, if any. The caller is
    /// responsible for releasing its engine registration.
    pub fn upsert_removable(
        &mut self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Option<StorageEntry> {
        let name = name.into();
        let entry = StorageEntry {
            id: self.allocate_id(),
            path: path.into(),
            name: name.clone(),
            kind: StorageKind::Removable,
            exposed: false,
            reserve_space: self.limits.reserve_space,
            max_file_size: self.limits.removable_max_file_size,
        };
        self.removables.insert(name, entry)
    }

    /// Removes and returns the removable entry stored under `name`.
    pub fn remove_removable(&mut self, name: &str) -> Option<StorageEntry> {
        self.removables.remove(name)
    }

    /// Updates the exposed flag of an entry. Returns false if the key is unknown.
    pub fn set_exposed(&mut self, key: &EntryKey, exposed: bool) -> bool {
        match self.get_mut(key) {
            Some(entry) => {
                entry.exposed = exposed;
                true
            }
            None => false,
        }
    }

    /// Looks up an entry.
    pub fn get(&self, key: &EntryKey) -> Option<&StorageEntry> {
        match key {
            EntryKey::Home => self.home.as_ref(),
            EntryKey::Removable(name) => self.removables.get(name),
        }
    }

    fn get_mut(&mut self, key: &EntryKey) -> Option<&mut StorageEntry> {
        match key {
            EntryKey::Home => self.home.as_mut(),
            EntryKey::Removable(name) => self.removables.get_mut(name),
        }
    }

    /// Iterates over all entries: home first, then removables ordered by name.
    pub fn all_entries(&self) -> impl Iterator<Item = &StorageEntry> {
        self.home.iter().chain(self.removables.values())
    }

    /// Returns the keys of all entries in iteration order.
    pub fn keys(&self) -> Vec<EntryKey> {
        self.all_entries().map(StorageEntry::key).collect()
    }

    /// Number of tracked entries, home included.
    pub fn len(&self) -> usize {
        self.home.iter().count() + self.removables.len()
    }

    /// Returns true if no entry is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, home included, in iteration order.
    pub fn drain(&mut self) -> Vec<StorageEntry> {
        let mut drained: Vec<StorageEntry> = self.home.take().into_iter().collect();
        drained.extend(std::mem::take(&mut self.removables).into_values());
        drained
    }

    /// Hands out the next unit not held by a tracked removable.
    ///
    /// Physical storage numbers are 16 bits wide, so the counter wraps back to
    /// the first removable unit after `0xFFFF`. Units still in use are skipped,
    /// so two tracked entries never share an id. A removable is always inserted
    /// after its id is allocated, which keeps at least one unit free.
    fn allocate_id(&mut self) -> StorageId {
        loop {
            let unit = self.next_unit;
            self.next_unit = if unit >= u32::from(u16::MAX) {
                FIRST_REMOVABLE_UNIT
            } else {
                unit + 1
            };

            let id = StorageId((unit << 16) | 1);
            if !self.removables.values().any(|e| e.id == id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_id_display() {
        assert_eq!(HOME_STORAGE_ID.to_string(), "0x00010001");
        assert_eq!(StorageId(0x0002_0001).to_string(), "0x00020001");
    }

    #[test]
    fn test_upsert_allocates_fresh_ids() {
        let mut registry = Registry::default();
        assert!(registry.upsert_removable("SDCARD1", "/media/user/SDCARD1").is_none());
        let first = registry
            .get(&EntryKey::Removable("SDCARD1".to_string()))
            .unwrap()
            .id();
        assert_eq!(first, StorageId(0x0002_0001));

        // Same name again replaces the entry and hands back the old one
        let replaced = registry
            .upsert_removable("SDCARD1", "/media/user/SDCARD1")
            .unwrap();
        assert_eq!(replaced.id(), first);

        let second = registry
            .get(&EntryKey::Removable("SDCARD1".to_string()))
            .unwrap()
            .id();
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rediscovered_volume_gets_new_id() {
        let mut registry = Registry::default();
        registry.upsert_removable("USB1", "/media/user/USB1");
        let removed = registry.remove_removable("USB1").unwrap();
        registry.upsert_removable("USB1", "/media/user/USB1");

        let again = registry
            .get(&EntryKey::Removable("USB1".to_string()))
            .unwrap();
        assert_ne!(removed.id(), again.id());
    }

    #[test]
    fn test_wrapped_allocation_skips_live_ids() {
        let mut registry = Registry::default();
        registry.upsert_removable("SDCARD1", "/media/user/SDCARD1");
        let live = registry
            .get(&EntryKey::Removable("SDCARD1".to_string()))
            .unwrap()
            .id();
        assert_eq!(live, StorageId(0x0002_0001));

        // Cycle through every other unit so the counter wraps back to 2
        for _ in FIRST_REMOVABLE_UNIT + 1..=u32::from(u16::MAX) {
            registry.upsert_removable("USB1", "/media/user/USB1");
            registry.remove_removable("USB1").unwrap();
        }
        assert_eq!(registry.next_unit, FIRST_REMOVABLE_UNIT);

        registry.upsert_removable("USB9", "/media/user/USB9");
        let fresh = registry
            .get(&EntryKey::Removable("USB9".to_string()))
            .unwrap()
            .id();
        assert_ne!(fresh, live);
        assert_eq!(fresh, StorageId(0x0003_0001));
    }

    #[test]
    fn test_allocation_wraps_after_last_unit() {
        let mut registry = Registry::default();
        registry.next_unit = u32::from(u16::MAX);
        registry.upsert_removable("USB1", "/media/user/USB1");
        registry.upsert_removable("USB2", "/media/user/USB2");

        let usb1 = registry
            .get(&EntryKey::Removable("USB1".to_string()))
            .unwrap()
            .id();
        let usb2 = registry
            .get(&EntryKey::Removable("USB2".to_string()))
            .unwrap()
            .id();
        assert_eq!(usb1, StorageId(0xFFFF_0001));
        assert_eq!(usb2, StorageId(0x0002_0001));
    }

    #[test]
    fn test_entries_start_unexposed() {
        let mut registry = Registry::default();
        registry.insert_home("/home/user", "Phone");
        registry.upsert_removable("USB1", "/media/user/USB1");

        assert!(registry.all_entries().all(|e| !e.is_exposed()));
    }

    #[test]
    fn test_set_exposed() {
        let mut registry = Registry::default();
        registry.insert_home("/home/user", "Phone");

        assert!(registry.set_exposed(&EntryKey::Home, true));
        assert!(registry.get(&EntryKey::Home).unwrap().is_exposed());
        assert!(!registry.set_exposed(&EntryKey::Removable("nope".to_string()), true));
    }

    #[test]
    fn test_iteration_order_home_first_then_by_name() {
        let mut registry = Registry::default();
        registry.upsert_removable("ZETA", "/media/user/ZETA");
        registry.upsert_removable("ALPHA", "/media/user/ALPHA");
        registry.insert_home("/home/user", "Phone");

        let names: Vec<&str> = registry.all_entries().map(|e| e.name()).collect();
        assert_eq!(names, vec!["Phone", "ALPHA", "ZETA"]);
        assert_eq!(
            registry.keys()[0],
            EntryKey::Home,
            "home entry must come first"
        );
    }

    #[test]
    fn test_removable_limits() {
        let mut registry = Registry::default();
        registry.insert_home("/home/user", "Phone");
        registry.upsert_removable("USB1", "/media/user/USB1");

        let home = registry.get(&EntryKey::Home).unwrap().descriptor();
        assert_eq!(home.max_file_size, 0);
        assert_eq!(home.reserve_space, DEFAULT_RESERVE_SPACE);

        let usb = registry
            .get(&EntryKey::Removable("USB1".to_string()))
            .unwrap()
            .descriptor();
        assert_eq!(usb.max_file_size, DEFAULT_REMOVABLE_MAX_FILE_SIZE);
        assert_eq!(usb.kind, StorageKind::Removable);
        assert!(usb.kind.scan_recursively());
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = Registry::default();
        registry.insert_home("/home/user", "Phone");
        registry.upsert_removable("USB1", "/media/user/USB1");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}

//! File records and the in-memory record table.
//!
//! A `FileRecord` holds everything the engine knows about one path: its remote
//! identity, the revisions last seen on each side, and the pending change on
//! each side. `RecordStore` keeps the live records with typed indices by
//! remote id and by relative path.

use crate::types::{ChangeLocation, ChangeState, Key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub type RecordId = u64;

/// Store shared between the watcher, the orchestrator and running tasks.
pub type SharedStore = Arc<Mutex<RecordStore>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Duplicate path: {0}")]
    DuplicatePath(String),

    #[error("Duplicate remote id: {0}")]
    DuplicateRemoteId(Key),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Synchronization state of one file or folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: RecordId,
    pub is_folder: bool,
    pub relative_path: String,
    #[serde(default)]
    pub remote_id: Option<Key>,
    #[serde(default)]
    pub url: String,
    /// Revision the local copy was last synchronized at.
    #[serde(default)]
    pub local_revision: Option<Key>,
    /// Revision last observed on the remote.
    #[serde(default)]
    pub remote_revision: Option<Key>,
    #[serde(default)]
    pub local_change: ChangeState,
    #[serde(default)]
    pub remote_change: ChangeState,
    #[serde(default)]
    pub change_location: ChangeLocation,
    #[serde(default)]
    pub watcher_synced: bool,
    /// Bumped on every local edit, so a finished task can tell whether the
    /// file changed again while it ran.
    #[serde(default, skip_serializing)]
    pub local_seq: u64,
}

impl FileRecord {
    /// Blank record; `id` is assigned by the store.
    pub fn new(relative_path: impl Into<String>, is_folder: bool) -> Self {
        Self {
            id: 0,
            is_folder,
            relative_path: relative_path.into(),
            remote_id: None,
            url: String::new(),
            local_revision: None,
            remote_revision: None,
            local_change: ChangeState::No,
            remote_change: ChangeState::No,
            change_location: ChangeLocation::No,
            watcher_synced: false,
            local_seq: 0,
        }
    }

    /// True when a local copy was synchronized at some revision.
    pub fn is_materialized(&self) -> bool {
        self.local_revision.is_some()
    }

    /// Recompute `change_location` from the two change states.
    pub fn classify(&mut self) {
        self.change_location = ChangeLocation::classify(self.local_change, self.remote_change);
    }
}

/// In-memory record table with incrementally maintained indices.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<RecordId, FileRecord>,
    by_remote_id: HashMap<Key, RecordId>,
    by_path: HashMap<String, RecordId>,
    next_id: RecordId,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Build a store from persisted records, keeping their ids.
    pub fn from_records(records: Vec<FileRecord>) -> Result<Self> {
        let mut store = Self::new();
        for record in records {
            store.next_id = store.next_id.max(record.id + 1);
            store.check_unique(&record, None)?;
            store.index(&record);
            store.records.insert(record.id, record);
        }
        Ok(store)
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Insert a new record, assigning its id.
    pub fn insert(&mut self, mut record: FileRecord) -> Result<RecordId> {
        self.check_unique(&record, None)?;
        record.id = self.next_id;
        self.next_id += 1;
        self.index(&record);
        let id = record.id;
        self.records.insert(id, record);
        Ok(id)
    }

    pub fn get(&self, id: RecordId) -> Option<&FileRecord> {
        self.records.get(&id)
    }

    /// Mutable access to a record.
    ///
    /// Callers that change `remote_id` or `relative_path` must go through
    /// `update` instead.
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut FileRecord> {
        self.records.get_mut(&id)
    }

    /// Mutate a record and keep the indices consistent.
    pub fn update<R>(&mut self, id: RecordId, f: impl FnOnce(&mut FileRecord) -> R) -> Result<R> {
        let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let old_path = record.relative_path.clone();
        let old_remote = record.remote_id.clone();
        let out = f(record);

        let record = &self.records[&id];
        if record.relative_path != old_path || record.remote_id != old_remote {
            let snapshot = record.clone();
            self.unindex_keys(&old_path, old_remote.as_ref(), id);
            if let Err(e) = self.check_unique(&snapshot, Some(id)) {
                // Restore the previous keys so the indices stay truthful.
                let record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
                record.relative_path = old_path;
                record.remote_id = old_remote;
                let restored = record.clone();
                self.index(&restored);
                return Err(e);
            }
            self.index(&snapshot);
        }
        Ok(out)
    }

    pub fn find_by_remote_id(&self, remote_id: &Key) -> Option<&FileRecord> {
        self.by_remote_id
            .get(remote_id)
            .and_then(|id| self.records.get(id))
    }

    pub fn find_by_path(&self, relative_path: &str) -> Option<&FileRecord> {
        self.by_path
            .get(relative_path)
            .and_then(|id| self.records.get(id))
    }

    /// Records with the given change location.
    pub fn with_location(&self, location: ChangeLocation) -> impl Iterator<Item = &FileRecord> {
        self.records
            .values()
            .filter(move |r| r.change_location == location)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<FileRecord> {
        let record = self.records.remove(&id)?;
        self.unindex_keys(&record.relative_path, record.remote_id.as_ref(), id);
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    /// In-place mutation of every record. Keys must not change.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileRecord> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_remote_id.clear();
        self.by_path.clear();
    }

    /// Owned copy of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.records.values().cloned().collect()
    }

    fn check_unique(&self, record: &FileRecord, skip: Option<RecordId>) -> Result<()> {
        if let Some(existing) = self.by_path.get(&record.relative_path) {
            if Some(*existing) != skip {
                return Err(StoreError::DuplicatePath(record.relative_path.clone()));
            }
        }
        if let Some(remote_id) = &record.remote_id {
            if let Some(existing) = self.by_remote_id.get(remote_id) {
                if Some(*existing) != skip {
                    return Err(StoreError::DuplicateRemoteId(remote_id.clone()));
                }
            }
        }
        Ok(())
    }

    fn index(&mut self, record: &FileRecord) {
        self.by_path.insert(record.relative_path.clone(), record.id);
        if let Some(remote_id) = &record.remote_id {
            self.by_remote_id.insert(remote_id.clone(), record.id);
        }
    }

    fn unindex_keys(&mut self, path: &str, remote_id: Option<&Key>, id: RecordId) {
        if self.by_path.get(path) == Some(&id) {
            self.by_path.remove(path);
        }
        if let Some(remote_id) = remote_id {
            if self.by_remote_id.get(remote_id) == Some(&id) {
                self.by_remote_id.remove(remote_id);
            }
        }
    }
}

/// Load/save capability for the record table.
pub trait RecordPersistence: Send + Sync {
    fn load(&self) -> Result<Vec<FileRecord>>;

    fn save(&self, records: &[FileRecord]) -> Result<()>;
}

/// Keeps the last saved table in memory. Used in tests and for ephemeral runs.
#[derive(Default)]
pub struct MemoryPersistence {
    saved: Mutex<Vec<FileRecord>>,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `save` was called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl RecordPersistence for MemoryPersistence {
    fn load(&self) -> Result<Vec<FileRecord>> {
        Ok(self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, records: &[FileRecord]) -> Result<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

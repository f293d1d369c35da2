//! Persistence for file records.
//!
//! Records are stored as pretty JSON in `.{project_id}-{backend}.json` inside
//! the storage directory, so that change tracking survives restarts.

use anyhow::{Context, Result};
use cloudsync_core::record::{self, FileRecord, RecordPersistence, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedRecords {
    pub records: Vec<FileRecord>,
}

/// JSON file holding the record table.
pub struct RecordStorage {
    path: PathBuf,
}

impl RecordStorage {
    /// Storage file for a project inside `storage_dir`.
    pub fn new(storage_dir: &Path, project_id: &str, backend: &str) -> Self {
        Self::at(storage_dir.join(format!(".{}-{}.json", project_id, backend)))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table for a fresh process.
    ///
    /// Every record is marked as seen by the watcher, since no engine write
    /// can be pending across a restart. The normalized table is saved back.
    pub fn open_store(&self) -> Result<RecordStore> {
        let mut records = RecordPersistence::load(self)
            .with_context(|| format!("Failed to load records from {}", self.path.display()))?;
        for record in &mut records {
            record.watcher_synced = true;
        }
        let store = RecordStore::from_records(records)
            .with_context(|| format!("Corrupt record table in {}", self.path.display()))?;
        RecordPersistence::save(self, &store.snapshot())?;
        Ok(store)
    }

    fn read(&self) -> Result<PersistedRecords> {
        if !self.path.exists() {
            return Ok(PersistedRecords::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, records: &[FileRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&PersistedRecords {
            records: records.to_vec(),
        })?;
        // Write then rename so a crash never leaves a truncated table.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved {} records to {}", records.len(), self.path.display());
        Ok(())
    }
}

impl RecordPersistence for RecordStorage {
    fn load(&self) -> record::Result<Vec<FileRecord>> {
        self.read()
            .map(|persisted| persisted.records)
            .map_err(|e| StoreError::Persistence(format!("{:#}", e)))
    }

    fn save(&self, records: &[FileRecord]) -> record::Result<()> {
        self.write(records)
            .map_err(|e| StoreError::Persistence(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_core::types::{ChangeState, Key};
    use tempfile::TempDir;

    fn record(path: &str, remote_id: i64) -> FileRecord {
        let mut record = FileRecord::new(path, false);
        record.remote_id = Some(Key::Number(remote_id));
        record.local_revision = Some(Key::from("r1"));
        record.local_change = ChangeState::Update;
        record
    }

    #[test]
    fn test_file_name_includes_project_and_backend() {
        let storage = RecordStorage::new(Path::new("/tmp/state"), "abc", "directory");
        assert_eq!(storage.path(), Path::new("/tmp/state/.abc-directory.json"));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let storage = RecordStorage::new(dir.path(), "p", "b");

        assert!(RecordPersistence::load(&storage).unwrap().is_empty());
    }

    #[test]
    fn test_save_creates_directory_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = RecordStorage::new(&dir.path().join("nested/state"), "p", "b");
        let mut store = RecordStore::new();
        store.insert(record("main.tex", 1)).unwrap();
        store.insert(record("fig/a.png", 2)).unwrap();

        RecordPersistence::save(&storage, &store.snapshot()).unwrap();
        let loaded = RecordPersistence::load(&storage).unwrap();

        assert_eq!(loaded, store.snapshot());
        let raw = fs::read_to_string(storage.path()).unwrap();
        assert!(raw.contains("\"relativePath\": \"main.tex\""));
    }

    #[test]
    fn test_open_store_marks_records_watcher_synced() {
        let dir = TempDir::new().unwrap();
        let storage = RecordStorage::new(dir.path(), "p", "b");
        let mut unsynced = record("main.tex", 1);
        unsynced.id = 4;
        unsynced.watcher_synced = false;
        RecordPersistence::save(&storage, &[unsynced]).unwrap();

        let store = storage.open_store().unwrap();

        let loaded = store.find_by_path("main.tex").unwrap();
        assert_eq!(loaded.id, 4);
        assert!(loaded.watcher_synced);
        assert_eq!(loaded.local_change, ChangeState::Update);
        assert!(RecordPersistence::load(&storage).unwrap()[0].watcher_synced);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = RecordStorage::new(dir.path(), "p", "b");
        fs::write(storage.path(), "not json").unwrap();

        assert!(matches!(
            RecordPersistence::load(&storage),
            Err(StoreError::Persistence(_))
        ));
        assert!(storage.open_store().is_err());
    }
}

//! Remote project store abstraction.
//!
//! The engine only needs a listing and six per-record operations. Transport,
//! authentication and request shapes belong to the implementation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

use crate::record::FileRecord;
use crate::types::Key;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Remote is offline")]
    Offline,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Remote entry not found: {0}")]
    NotFound(String),

    #[error("Remote conflict: {0}")]
    Conflict(String),

    #[error("Remote error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// One entry of the remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub remote_id: Key,
    pub relative_path: String,
    pub is_folder: bool,
    pub revision: Option<Key>,
    pub url: String,
}

/// Identity assigned by the remote when an entry is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStamp {
    pub remote_id: Key,
    pub revision: Option<Key>,
}

/// Remote replica operations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Full listing of the remote project.
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>>;

    /// Create a remote file from local content.
    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> Result<RemoteStamp>;

    /// Create a remote folder under `parent` (`None` for the project root).
    async fn create_remote_folder(
        &self,
        record: &FileRecord,
        parent: Option<&FileRecord>,
    ) -> Result<RemoteStamp>;

    /// Fetch the content of a remote file.
    async fn download(&self, record: &FileRecord) -> Result<Vec<u8>>;

    /// Replace the content of an existing remote file, returning its new revision.
    async fn update_remote(&self, record: &FileRecord, content: Vec<u8>) -> Result<Option<Key>>;

    async fn delete_remote(&self, record: &FileRecord) -> Result<()>;
}

#[async_trait]
impl<T: Backend + ?Sized> Backend for std::sync::Arc<T> {
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        (**self).load_file_list().await
    }

    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> Result<RemoteStamp> {
        (**self).upload(record, content).await
    }

    async fn create_remote_folder(
        &self,
        record: &FileRecord,
        parent: Option<&FileRecord>,
    ) -> Result<RemoteStamp> {
        (**self).create_remote_folder(record, parent).await
    }

    async fn download(&self, record: &FileRecord) -> Result<Vec<u8>> {
        (**self).download(record).await
    }

    async fn update_remote(&self, record: &FileRecord, content: Vec<u8>) -> Result<Option<Key>> {
        (**self).update_remote(record, content).await
    }

    async fn delete_remote(&self, record: &FileRecord) -> Result<()> {
        (**self).delete_remote(record).await
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: RemoteEntry,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct RemoteState {
    entries: BTreeMap<Key, StoredEntry>,
    next_id: i64,
    next_revision: i64,
}

impl RemoteState {
    fn next_revision(&mut self) -> Key {
        self.next_revision += 1;
        Key::Text(format!("rev-{}", self.next_revision))
    }

    fn find_path(&self, path: &str) -> Option<&StoredEntry> {
        self.entries
            .values()
            .find(|stored| stored.entry.relative_path == path)
    }

    fn insert(&mut self, path: &str, is_folder: bool, content: Vec<u8>) -> RemoteStamp {
        self.next_id += 1;
        let remote_id = Key::Number(self.next_id);
        let revision = self.next_revision();
        let entry = RemoteEntry {
            remote_id: remote_id.clone(),
            relative_path: path.to_string(),
            is_folder,
            revision: Some(revision.clone()),
            url: format!("memory://{}", path),
        };
        self.entries
            .insert(remote_id.clone(), StoredEntry { entry, content });
        RemoteStamp {
            remote_id,
            revision: Some(revision),
        }
    }
}

/// In-memory remote for tests and embedding.
///
/// Every operation except `load_file_list` increments `operation_count`.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    operations: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(BackendError::Offline);
        }
        Ok(())
    }

    fn remote_id_of(record: &FileRecord) -> Result<&Key> {
        record
            .remote_id
            .as_ref()
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of per-record operations performed so far.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    /// Create a remote file as if another client uploaded it.
    pub fn put_file(&self, path: &str, content: &[u8]) -> RemoteStamp {
        self.state().insert(path, false, content.to_vec())
    }

    /// Create a remote folder as if another client created it.
    pub fn put_folder(&self, path: &str) -> RemoteStamp {
        self.state().insert(path, true, Vec::new())
    }

    /// Change the content of a remote file, bumping its revision.
    pub fn modify(&self, path: &str, content: &[u8]) -> Option<Key> {
        let mut state = self.state();
        let revision = state.next_revision();
        let stored = state
            .entries
            .values_mut()
            .find(|stored| stored.entry.relative_path == path)?;
        stored.content = content.to_vec();
        stored.entry.revision = Some(revision.clone());
        Some(revision)
    }

    /// Rename a remote entry, keeping its id and revision.
    pub fn rename(&self, from: &str, to: &str) -> bool {
        let mut state = self.state();
        match state
            .entries
            .values_mut()
            .find(|stored| stored.entry.relative_path == from)
        {
            Some(stored) => {
                stored.entry.relative_path = to.to_string();
                stored.entry.url = format!("memory://{}", to);
                true
            }
            None => false,
        }
    }

    /// Remove a remote entry as if another client deleted it.
    pub fn remove(&self, path: &str) -> bool {
        let mut state = self.state();
        let key = state.find_path(path).map(|s| s.entry.remote_id.clone());
        match key {
            Some(key) => state.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state().find_path(path).map(|s| s.content.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state().find_path(path).is_some()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .state()
            .entries
            .values()
            .map(|s| s.entry.relative_path.clone())
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        self.check_online()?;
        Ok(self
            .state()
            .entries
            .values()
            .map(|s| s.entry.clone())
            .collect())
    }

    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> Result<RemoteStamp> {
        self.check_online()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if state.find_path(&record.relative_path).is_some() {
            return Err(BackendError::Conflict(record.relative_path.clone()));
        }
        Ok(state.insert(&record.relative_path, false, content))
    }

    async fn create_remote_folder(
        &self,
        record: &FileRecord,
        parent: Option<&FileRecord>,
    ) -> Result<RemoteStamp> {
        self.check_online()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if let Some(parent) = parent {
            let parent_id = Self::remote_id_of(parent)?;
            if !state.entries.contains_key(parent_id) {
                return Err(BackendError::NotFound(parent.relative_path.clone()));
            }
        }
        if state.find_path(&record.relative_path).is_some() {
            return Err(BackendError::Conflict(record.relative_path.clone()));
        }
        Ok(state.insert(&record.relative_path, true, Vec::new()))
    }

    async fn download(&self, record: &FileRecord) -> Result<Vec<u8>> {
        self.check_online()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let remote_id = Self::remote_id_of(record)?;
        self.state()
            .entries
            .get(remote_id)
            .map(|s| s.content.clone())
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))
    }

    async fn update_remote(&self, record: &FileRecord, content: Vec<u8>) -> Result<Option<Key>> {
        self.check_online()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let remote_id = Self::remote_id_of(record)?.clone();
        let mut state = self.state();
        let revision = state.next_revision();
        let stored = state
            .entries
            .get_mut(&remote_id)
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))?;
        stored.content = content;
        stored.entry.revision = Some(revision.clone());
        Ok(Some(revision))
    }

    async fn delete_remote(&self, record: &FileRecord) -> Result<()> {
        self.check_online()?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        let remote_id = Self::remote_id_of(record)?;
        self.state()
            .entries
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))
    }
}

//! Remote project store kept in a plain directory.
//!
//! Content lives under `<root>/files/`, identities and revisions in
//! `<root>/manifest.json`. Ids and revisions are random UUIDs. Several
//! daemons may point at the same directory, so the manifest is re-read on
//! every operation.

use async_trait::async_trait;
use cloudsync_core::backend::{Backend, BackendError, RemoteEntry, RemoteStamp, Result};
use cloudsync_core::fs::validate_path;
use cloudsync_core::record::FileRecord;
use cloudsync_core::types::Key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const BACKEND_NAME: &str = "directory";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    path: String,
    is_folder: bool,
    revision: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    fn find_path(&self, path: &str) -> Option<&String> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.path == path)
            .map(|(id, _)| id)
    }
}

fn io_error(e: std::io::Error) -> BackendError {
    BackendError::Other(e.to_string())
}

fn new_key() -> String {
    Uuid::new_v4().to_string()
}

pub struct DirectoryBackend {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirectoryBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn content_path(&self, relative: &str) -> Result<PathBuf> {
        let relative =
            validate_path(relative).map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(self.root.join("files").join(relative))
    }

    fn url(&self, relative: &str) -> String {
        format!("file://{}", self.root.join("files").join(relative).display())
    }

    async fn load_manifest(&self) -> Result<Manifest> {
        match fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Err(BackendError::Offline),
        }
        match fs::read_to_string(self.manifest_path()).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| BackendError::Other(format!("Corrupt manifest: {}", e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        let contents = serde_json::to_string_pretty(manifest)
            .map_err(|e| BackendError::Other(e.to_string()))?;
        let tmp = self.root.join(format!("manifest.{}.tmp", new_key()));
        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, self.manifest_path())
            .await
            .map_err(io_error)
    }

    fn remote_id(record: &FileRecord) -> Result<String> {
        record
            .remote_id
            .as_ref()
            .map(|key| key.to_string())
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))
    }

    fn lookup<'a>(manifest: &'a Manifest, record: &FileRecord) -> Result<(String, &'a ManifestEntry)> {
        let id = Self::remote_id(record)?;
        let entry = manifest
            .entries
            .get(&id)
            .ok_or_else(|| BackendError::NotFound(record.relative_path.clone()))?;
        Ok((id, entry))
    }

    async fn create_entry(
        &self,
        record: &FileRecord,
        content: Option<Vec<u8>>,
        parent: Option<&FileRecord>,
    ) -> Result<RemoteStamp> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.load_manifest().await?;
        if let Some(parent) = parent {
            let (_, entry) = Self::lookup(&manifest, parent)?;
            if !entry.is_folder {
                return Err(BackendError::Conflict(format!(
                    "Parent is not a folder: {}",
                    parent.relative_path
                )));
            }
        }
        if manifest.find_path(&record.relative_path).is_some() {
            return Err(BackendError::Conflict(record.relative_path.clone()));
        }

        let target = self.content_path(&record.relative_path)?;
        match &content {
            Some(content) => {
                if let Some(dir) = target.parent() {
                    fs::create_dir_all(dir).await.map_err(io_error)?;
                }
                fs::write(&target, content).await.map_err(io_error)?;
            }
            None => fs::create_dir_all(&target).await.map_err(io_error)?,
        }

        let id = new_key();
        let revision = new_key();
        manifest.entries.insert(
            id.clone(),
            ManifestEntry {
                path: record.relative_path.clone(),
                is_folder: content.is_none(),
                revision: revision.clone(),
            },
        );
        self.save_manifest(&manifest).await?;
        debug!("Created remote entry {} for {}", id, record.relative_path);
        Ok(RemoteStamp {
            remote_id: Key::Text(id),
            revision: Some(Key::Text(revision)),
        })
    }
}

#[async_trait]
impl Backend for DirectoryBackend {
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        let _guard = self.lock.lock().await;
        let manifest = self.load_manifest().await?;
        Ok(manifest
            .entries
            .into_iter()
            .map(|(id, entry)| RemoteEntry {
                remote_id: Key::Text(id),
                url: self.url(&entry.path),
                relative_path: entry.path,
                is_folder: entry.is_folder,
                revision: Some(Key::Text(entry.revision)),
            })
            .collect())
    }

    async fn upload(&self, record: &FileRecord, content: Vec<u8>) -> Result<RemoteStamp> {
        self.create_entry(record, Some(content), None).await
    }

    async fn create_remote_folder(
        &self,
        record: &FileRecord,
        parent: Option<&FileRecord>,
    ) -> Result<RemoteStamp> {
        self.create_entry(record, None, parent).await
    }

    async fn download(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let manifest = self.load_manifest().await?;
        let (_, entry) = Self::lookup(&manifest, record)?;
        let path = self.content_path(&entry.path)?;
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => BackendError::NotFound(entry.path.clone()),
            _ => io_error(e),
        })
    }

    async fn update_remote(&self, record: &FileRecord, content: Vec<u8>) -> Result<Option<Key>> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.load_manifest().await?;
        let (id, entry) = Self::lookup(&manifest, record)?;
        let path = self.content_path(&entry.path)?;
        fs::write(&path, content).await.map_err(io_error)?;

        let revision = new_key();
        if let Some(entry) = manifest.entries.get_mut(&id) {
            entry.revision = revision.clone();
        }
        self.save_manifest(&manifest).await?;
        Ok(Some(Key::Text(revision)))
    }

    async fn delete_remote(&self, record: &FileRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.load_manifest().await?;
        let (id, entry) = Self::lookup(&manifest, record)?;
        let path = self.content_path(&entry.path)?;
        let removed = if entry.is_folder {
            // Entries below the folder go with it.
            let prefix = format!("{}/", entry.path);
            manifest.entries.retain(|_, e| !e.path.starts_with(&prefix));
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(e)),
        }
        manifest.entries.remove(&id);
        self.save_manifest(&manifest).await
    }
}

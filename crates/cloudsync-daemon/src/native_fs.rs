//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use cloudsync_core::fs::{validate_path, FileSystem, FsError, LocalEntry, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Local replica rooted at a directory.
pub struct NativeFs {
    base_path: PathBuf,
}

fn io_error(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = validate_path(path)?;
        if relative.is_empty() {
            Ok(self.base_path.clone())
        } else {
            Ok(self.base_path.join(relative))
        }
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path).await.map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn walk(&self) -> Result<Vec<LocalEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(dir_path) = pending.pop() {
            let full_path = self.full_path(&dir_path)?;
            let mut dir = fs::read_dir(&full_path)
                .await
                .map_err(|e| io_error(&dir_path, e))?;

            while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&dir_path, e))? {
                let name = entry.file_name().to_string_lossy().to_string();
                let path = if dir_path.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir_path, name)
                };
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path.clone());
                }
                entries.push(LocalEntry {
                    path,
                    is_dir: file_type.is_dir(),
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

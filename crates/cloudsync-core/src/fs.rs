//! FileSystem trait abstraction for the local replica.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in cloudsync-daemon) - Uses tokio::fs
//!
//! All paths are relative to the replica root, posix-style.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::types::{normalize_path, parent_path};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// One entry of a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Path relative to the root
    pub path: String,
    pub is_dir: bool,
}

/// Local replica operations needed by the engine.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Every file and directory below the root, parents before children
    async fn walk(&self) -> Result<Vec<LocalEntry>>;
}

/// Reject absolute paths, traversal and NUL bytes.
pub fn validate_path(path: &str) -> Result<String> {
    let normalized = normalize_path(path);
    if path.contains('\0')
        || path.starts_with('/')
        || normalized.split('/').any(|part| part == ".." || part == ".")
    {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(normalized)
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct InMemoryFs {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn mkdir_all(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        if let Some(parent) = parent_path(path) {
            Self::mkdir_all(nodes, parent)?;
        }
        match nodes.get(path) {
            Some(Node::File(_)) => Err(FsError::NotDirectory(path.to_string())),
            Some(Node::Dir) => Ok(()),
            None => {
                nodes.insert(path.to_string(), Node::Dir);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(FsError::IsDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = parent_path(&path) {
            Self::mkdir_all(&mut nodes, parent)?;
        }
        if let Some(Node::Dir) = nodes.get(&path) {
            return Err(FsError::IsDirectory(path));
        }
        nodes.insert(path, Node::File(content.to_vec()));
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        Self::mkdir_all(&mut nodes, &path)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = validate_path(path)?;
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        match nodes.get(&path) {
            None => return Err(FsError::NotFound(path)),
            Some(Node::Dir) => {
                let prefix = format!("{}/", path);
                if nodes.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(FsError::NotEmpty(path));
                }
            }
            Some(Node::File(_)) => {}
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = validate_path(path)?;
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Ok(path.is_empty() || nodes.contains_key(&path))
    }

    async fn walk(&self) -> Result<Vec<LocalEntry>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        // BTreeMap order already puts "a" before "a/b".
        Ok(nodes
            .iter()
            .map(|(path, node)| LocalEntry {
                path: path.clone(),
                is_dir: matches!(node, Node::Dir),
            })
            .collect())
    }
}

// Lets tests keep a handle on the filesystem they hand to the engine.
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn walk(&self) -> Result<Vec<LocalEntry>> {
        (**self).walk().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("main.tex", b"hello world").await.unwrap();
        assert_eq!(fs.read("main.tex").await.unwrap(), b"hello world");
        assert!(fs.exists("main.tex").await.unwrap());
        assert!(!fs.exists("missing.tex").await.unwrap());

        fs.delete("main.tex").await.unwrap();
        assert!(!fs.exists("main.tex").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_walk_is_ordered() {
        let fs = InMemoryFs::new();
        fs.write("a/b/c.tex", b"content").await.unwrap();

        let entries = fs.walk().await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.tex"]);
        assert!(entries[0].is_dir);
        assert!(!entries[2].is_dir);
    }

    #[tokio::test]
    async fn test_delete_non_empty_directory_fails() {
        let fs = InMemoryFs::new();
        fs.write("a/c.tex", b"x").await.unwrap();

        assert!(matches!(fs.delete("a").await, Err(FsError::NotEmpty(_))));
        fs.delete("a/c.tex").await.unwrap();
        fs.delete("a").await.unwrap();
        assert!(fs.walk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let fs = InMemoryFs::new();
        assert!(matches!(
            fs.write("../escape.tex", b"x").await,
            Err(FsError::InvalidPath(_))
        ));
        assert!(matches!(
            fs.read("a/\0b").await,
            Err(FsError::InvalidPath(_))
        ));
    }
}

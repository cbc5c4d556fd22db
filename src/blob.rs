//! Raw upload storage.
//!
//! Uploaded bytes are kept so a document can be reprocessed later. A blob
//! handle is the path relative to the store root.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use ragline_core::error::{RagError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `path`, returning the handle to read it back.
    async fn store(&self, bytes: &[u8], path: &str) -> Result<String>;

    async fn read(&self, handle: &str) -> Result<Vec<u8>>;

    /// Deleting a missing blob succeeds.
    async fn delete(&self, handle: &str) -> Result<()>;

    async fn delete_all(&self) -> Result<()>;
}

/// Blobs on the local filesystem under `storage.path`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, handle: &str) -> Result<PathBuf> {
        let relative = Path::new(handle);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if handle.is_empty() || !clean {
            return Err(RagError::InvalidInput(format!("invalid blob path: {}", handle)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, bytes: &[u8], path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RagError::storage)?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(RagError::storage)?;
        Ok(path.to_string())
    }

    async fn read(&self, handle: &str) -> Result<Vec<u8>> {
        let full = self.resolve(handle)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RagError::not_found("blob", handle))
            }
            Err(e) => Err(RagError::storage(e)),
        }
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let full = self.resolve(handle)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::storage(e)),
        }
    }

    async fn delete_all(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::storage(e)),
        }
    }
}

/// In-memory blobs for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> RagError {
    RagError::storage("blob store lock poisoned")
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(&self, bytes: &[u8], path: &str) -> Result<String> {
        self.blobs
            .lock()
            .map_err(poisoned)?
            .insert(path.to_string(), bytes.to_vec());
        Ok(path.to_string())
    }

    async fn read(&self, handle: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .map_err(poisoned)?
            .get(handle)
            .cloned()
            .ok_or_else(|| RagError::not_found("blob", handle))
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        self.blobs.lock().map_err(poisoned)?.remove(handle);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.blobs.lock().map_err(poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_read_delete() {
        let tmp = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(tmp.path().join("blobs"));

        let handle = blobs.store(b"hello", "doc-1/source.txt").await.unwrap();
        assert_eq!(handle, "doc-1/source.txt");
        assert_eq!(blobs.read(&handle).await.unwrap(), b"hello");

        blobs.delete(&handle).await.unwrap();
        blobs.delete(&handle).await.unwrap();
        let err = blobs.read(&handle).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(tmp.path());
        assert!(blobs.store(b"x", "../escape.txt").await.is_err());
        assert!(blobs.store(b"x", "/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_delete_all() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("blobs");
        let blobs = FsBlobStore::new(&root);
        blobs.store(b"a", "a.txt").await.unwrap();
        blobs.delete_all().await.unwrap();
        assert!(!root.exists());
        blobs.delete_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        let blobs = MemoryBlobStore::new();
        blobs.store(b"abc", "k").await.unwrap();
        assert_eq!(blobs.read("k").await.unwrap(), b"abc");
        assert_eq!(blobs.len(), 1);
        blobs.delete_all().await.unwrap();
        assert!(blobs.is_empty());
    }
}

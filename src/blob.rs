//! Blob storage for raw media payloads.
//!
//! Only the reference lives in the relational store; bytes go here.
//! The interface is deliberately small (`put`/`get`/`probe`) so the
//! backing medium (node-local disk vs. a shared POSIX mount) stays
//! opaque to the rest of the system.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::BlobError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `meeting_id/chunk_seq` and return the reference.
    async fn put(&self, meeting_id: &str, chunk_seq: u64, bytes: &[u8])
    -> Result<String, BlobError>;

    async fn get(&self, media_ref: &str) -> Result<Vec<u8>, BlobError>;

    /// Cheap liveness probe used by the storage health endpoint.
    async fn probe(&self) -> Result<(), BlobError>;
}

/// Filesystem-backed blob store. Works for both `local` and `shared`
/// storage modes; the mount point decides which one it is.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, media_ref: &str) -> Result<PathBuf, BlobError> {
        // Refs are produced by `put`; anything with a traversal step is
        // not ours.
        if media_ref.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(BlobError::NotFound(media_ref.to_string()));
        }
        Ok(self.root.join(media_ref))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let media_ref = format!("{meeting_id}/{chunk_seq}");
        let path = self.path_for(&media_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(media_ref)
    }

    async fn get(&self, media_ref: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(media_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(media_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn probe(&self) -> Result<(), BlobError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let probe_path = self.root.join(".probe");
        tokio::fs::write(&probe_path, b"ok").await?;
        tokio::fs::remove_file(&probe_path).await?;
        Ok(())
    }
}

/// In-memory blob store for tests and ephemeral development runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: tokio::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
        bytes: &[u8],
    ) -> Result<String, BlobError> {
        let media_ref = format!("{meeting_id}/{chunk_seq}");
        self.blobs
            .lock()
            .await
            .insert(media_ref.clone(), bytes.to_vec());
        Ok(media_ref)
    }

    async fn get(&self, media_ref: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .await
            .get(media_ref)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(media_ref.to_string()))
    }

    async fn probe(&self) -> Result<(), BlobError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let media_ref = store.put("m1", 0, b"audio bytes").await.unwrap();
        assert_eq!(media_ref, "m1/0");
        assert_eq!(store.get(&media_ref).await.unwrap(), b"audio bytes");
    }

    #[tokio::test]
    async fn test_fs_blob_missing_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.get("m1/7").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_blob_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.probe().await.unwrap();
    }
}

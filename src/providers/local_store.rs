//! Local filesystem blob store
//!
//! Blobs live under `<root>/blobs/<shard>/<object-id>/`. Writes land in
//! `<root>/tmp/` first and are promoted with a rename, so a crash mid-write
//! leaves at worst an abandoned partial in the staging area and never a
//! truncated blob at its final key.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

use super::blob_store::{BlobInfo, BlobStoreProvider, ObjectDirEntry};

const ENOSPC: i32 = 28;

/// Local filesystem blob store
pub struct LocalBlobStore {
    blob_dir: PathBuf,
    tmp_dir: PathBuf,
    chunk_bytes: usize,
}

impl LocalBlobStore {
    /// Create a new local blob store, creating its directories if needed
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let blob_dir = config.blob_dir();
        let tmp_dir = config.tmp_dir();
        std::fs::create_dir_all(&blob_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            blob_dir,
            tmp_dir,
            chunk_bytes: config.blob_chunk_bytes,
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.blob_dir.join(key)
    }

    async fn write_chunked(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(path).await.map_err(map_io)?;
        for chunk in data.chunks(self.chunk_bytes) {
            file.write_all(chunk).await.map_err(map_io)?;
        }
        file.sync_all().await.map_err(map_io)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStoreProvider for LocalBlobStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let final_path = self.blob_path(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(map_io)?;
        }

        // tmp and blobs share a filesystem root, so the rename is atomic.
        let part_path = self.tmp_dir.join(format!("{}.part", Uuid::new_v4()));
        if let Err(e) = self.write_chunked(&part_path, data).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(map_io(e));
        }

        Ok(data.len() as u64)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(map_io(e)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<BlobInfo>> {
        match fs::metadata(self.blob_path(key)).await {
            Ok(meta) => Ok(Some(BlobInfo {
                key: key.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn delete_object_dir(&self, dir_key: &str) -> Result<()> {
        match fs::remove_dir_all(self.blob_dir.join(dir_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn list_object_dirs(&self) -> Result<Vec<ObjectDirEntry>> {
        let mut entries = Vec::new();
        let mut shards = match fs::read_dir(&self.blob_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(map_io(e)),
        };

        while let Some(shard) = shards.next_entry().await.map_err(map_io)? {
            if !shard.file_type().await.map_err(map_io)?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let mut objects = fs::read_dir(shard.path()).await.map_err(map_io)?;
            while let Some(object) = objects.next_entry().await.map_err(map_io)? {
                let meta = object.metadata().await.map_err(map_io)?;
                if !meta.is_dir() {
                    continue;
                }
                // An unreadable mtime must not make the sweep treat the
                // directory as ancient.
                let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
                entries.push(ObjectDirEntry {
                    dir_key: format!("{}/{}", shard_name, object.file_name().to_string_lossy()),
                    modified,
                });
            }
        }

        Ok(entries)
    }

    async fn sweep_partials(&self, older_than: SystemTime) -> Result<usize> {
        let mut removed = 0;
        let mut partials = match fs::read_dir(&self.tmp_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(map_io(e)),
        };

        while let Some(entry) = partials.next_entry().await.map_err(map_io)? {
            let meta = entry.metadata().await.map_err(map_io)?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
            if modified < older_than && fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.blob_dir.exists() && self.tmp_dir.exists())
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

/// Classify an IO failure: a full disk is terminal, anything else may be
/// retried by the orchestrator.
fn map_io(e: std::io::Error) -> Error {
    if e.raw_os_error() == Some(ENOSPC) {
        Error::StorageExhausted {
            attempts: 1,
            message: e.to_string(),
        }
    } else {
        Error::TransientStorage(e.to_string())
    }
}

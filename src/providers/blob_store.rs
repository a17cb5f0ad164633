//! Blob store provider trait for durable object storage

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::Result;

/// Metadata about a stored blob
#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Key the blob is stored under
    pub key: String,
    /// Size in bytes
    pub size: u64,
}

/// An object directory found by a sweep scan
#[derive(Debug, Clone)]
pub struct ObjectDirEntry {
    /// Directory key, `<shard>/<object-id>`
    pub dir_key: String,
    /// Last modification time, used against the orphan grace window
    pub modified: SystemTime,
}

/// Trait for blob storage
///
/// Keys are relative paths of the form `<shard>/<object-id>/<blob-name>`;
/// the orchestrator composes them from a `ContentAddress`.
///
/// Implementations:
/// - `LocalBlobStore`: local filesystem with atomic rename promotion
#[async_trait]
pub trait BlobStoreProvider: Send + Sync {
    /// Write a blob under the given key
    ///
    /// The write must be atomic: a reader never observes a partially
    /// written blob at the final key, even across a crash. Returns the
    /// number of bytes written.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Read the blob stored under the key
    ///
    /// Returns `Error::NotFound` when no blob exists at the key.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Size of the blob if it exists
    async fn head(&self, key: &str) -> Result<Option<BlobInfo>>;

    /// Delete a single blob; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete an object directory and every blob inside it
    async fn delete_object_dir(&self, dir_key: &str) -> Result<()>;

    /// List every object directory with its last-modified time
    ///
    /// Used by the orphan sweep to find blob directories with no committed
    /// catalog entry.
    async fn list_object_dirs(&self) -> Result<Vec<ObjectDirEntry>>;

    /// Remove abandoned partial uploads last touched before the cutoff
    ///
    /// Returns the number of partials removed.
    async fn sweep_partials(&self, older_than: SystemTime) -> Result<usize>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

//! Content addressing
//!
//! The digest is SHA-256 over the canonical serialization, so identical
//! content always addresses the same object. Registration of a digest must
//! be mutually exclusive per digest across the whole process; unrelated
//! digests proceed in parallel. [`DigestLocks`] provides that exclusion,
//! the catalog provides the durable compare-and-swap.

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::types::NormalizedDocument;

/// Hex SHA-256 of the canonical document bytes
pub fn digest_document(doc: &NormalizedDocument) -> Result<String> {
    let bytes = doc.to_canonical_bytes()?;
    Ok(digest_bytes(&bytes))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Per-digest mutual exclusion for the register-then-store window
///
/// Entries are dropped again once the last holder releases its guard, so
/// the map tracks in-flight digests rather than every digest ever seen.
#[derive(Default)]
pub struct DigestLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DigestLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for exclusive ownership of `digest`
    pub async fn acquire(self: &Arc<Self>, digest: &str) -> DigestGuard {
        let lock = self
            .locks
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        DigestGuard {
            guard: Some(guard),
            digest: digest.to_string(),
            locks: Arc::clone(self),
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive hold on one digest; released on drop
pub struct DigestGuard {
    guard: Option<OwnedMutexGuard<()>>,
    digest: String,
    locks: Arc<DigestLocks>,
}

impl std::fmt::Debug for DigestGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestGuard")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

impl Drop for DigestGuard {
    fn drop(&mut self) {
        self.guard.take();
        // The map's own Arc is the only reference left once no guard and
        // no waiter holds a clone, which makes removal safe.
        self.locks
            .locks
            .remove_if(&self.digest, |_, lock| Arc::strong_count(lock) == 1);
    }
}

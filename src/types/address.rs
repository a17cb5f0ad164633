//! Content address of a stored object

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Content address assigned after digesting
///
/// The digest identifies content; the object id names where it is stored.
/// Two ingestions of byte-identical content share one address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentAddress {
    /// Lowercase hex SHA-256 of the canonical document bytes
    pub digest: String,
    /// Storage object id
    pub id: Ulid,
}

impl ContentAddress {
    pub fn new(digest: String, id: Ulid) -> Self {
        Self { digest, id }
    }

    /// Two-character shard taken from the tail of the object id
    pub fn shard(&self) -> String {
        let id = self.id.to_string();
        id[id.len() - 2..].to_string()
    }

    /// Relative directory key for this object, "<shard>/<id>"
    pub fn dir_key(&self) -> String {
        format!("{}/{}", self.shard(), self.id)
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, &self.digest[..self.digest.len().min(12)])
    }
}

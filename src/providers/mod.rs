//! Provider abstractions for blob storage
//!
//! The pipeline talks to durable storage through the `BlobStoreProvider`
//! trait so the local filesystem backend can be swapped for an object store
//! without touching the orchestrator.

pub mod blob_store;
pub mod local_store;

pub use blob_store::{BlobInfo, BlobStoreProvider, ObjectDirEntry};
pub use local_store::LocalBlobStore;

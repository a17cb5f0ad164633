//! memories: ingestion and content-addressed storage for personal files
//!
//! This crate takes heterogeneous user files (photos, PDFs, ebooks, Word
//! documents), classifies them by content signature, extracts their pages
//! and metadata, normalizes everything into one canonical document model,
//! and stores each distinct document exactly once under a digest-derived
//! address with reference-counted deduplication.

pub mod address;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod staging;
pub mod storage;
pub mod types;

pub use config::MemoriesConfig;
pub use error::{Error, Result};
pub use pipeline::{IngestWorker, IngestionHandle, IngestionPipeline};
pub use staging::StagingWatcher;
pub use storage::{CatalogDb, StorageOrchestrator, StoreOutcome};
pub use types::{
    CompletionEvent, ContentAddress, DetectedFormat, IngestionProgress, IngestionStage,
    IngestionStatus, NormalizedDocument, SourceFile,
};

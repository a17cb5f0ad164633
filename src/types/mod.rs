//! Core types for the ingestion pipeline

pub mod address;
pub mod document;
pub mod format;
pub mod source;
pub mod status;

pub use address::ContentAddress;
pub use document::{meta_keys, NormalizedDocument, Page, PageImage};
pub use format::{DetectedFormat, ImageKind};
pub use source::{SourceFile, SourceOrigin};
pub use status::{CompletionEvent, IngestionProgress, IngestionStage, IngestionStatus};

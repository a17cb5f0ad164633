//! Ingestion pipeline: submission queue, progress registry, and workers

pub mod coordinator;
pub mod worker;

pub use coordinator::{IngestionHandle, IngestionPipeline, IngestionTask, PipelineStats};
pub use worker::IngestWorker;

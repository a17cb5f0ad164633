//! Durable storage: catalog database, blob orchestration, orphan sweep

pub mod database;
pub mod orchestrator;

pub use database::{CatalogDb, CatalogStats, DigestReservation, IngestionRecord, ObjectRecord};
pub use orchestrator::{StorageOrchestrator, StoreOutcome, StoreRequest, SweepReport};

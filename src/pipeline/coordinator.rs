//! Submission front door for the ingestion pipeline
//!
//! Accepts raw source files, registers live progress, journals the attempt,
//! and hands tasks to the worker pool over a bounded channel. A full channel
//! makes `submit` wait, which is the backpressure signal to callers.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::MemoriesConfig;
use crate::error::{Error, Result};
use crate::storage::CatalogDb;
use crate::types::{CompletionEvent, IngestionProgress, IngestionStatus, SourceFile};

/// One queued ingestion attempt travelling to the worker pool
pub struct IngestionTask {
    pub id: Uuid,
    pub source: SourceFile,
    /// Fired exactly once when the attempt reaches a terminal status
    pub completion: oneshot::Sender<CompletionEvent>,
}

/// Caller-side handle for one submitted ingestion
#[derive(Debug)]
pub struct IngestionHandle {
    pub id: Uuid,
    completion: oneshot::Receiver<CompletionEvent>,
}

impl IngestionHandle {
    /// Wait for the terminal completion event
    pub async fn wait(self) -> Result<CompletionEvent> {
        self.completion
            .await
            .map_err(|_| Error::internal("worker dropped the ingestion before completing it"))
    }
}

/// Progress registry plus the sending half of the task queue
pub struct IngestionPipeline {
    /// Live progress for every ingestion this process has seen
    progress: Arc<DashMap<Uuid, IngestionProgress>>,
    /// Channel into the worker pool
    sender: mpsc::Sender<IngestionTask>,
    /// Number of workers draining the channel
    worker_count: usize,
    /// Catalog holding the durable ingestion journal
    catalog: Arc<CatalogDb>,
}

impl IngestionPipeline {
    /// Create the pipeline front door and the receiver the worker pool drains
    pub fn new(
        config: &MemoriesConfig,
        catalog: Arc<CatalogDb>,
    ) -> (Self, mpsc::Receiver<IngestionTask>) {
        let (sender, receiver) = mpsc::channel(config.pipeline.queue_size);

        let pipeline = Self {
            progress: Arc::new(DashMap::new()),
            sender,
            worker_count: config.pipeline.effective_workers(),
            catalog,
        };

        (pipeline, receiver)
    }

    /// Queue a source file for ingestion
    ///
    /// Waits while the queue is full. The returned handle resolves once the
    /// attempt reaches a terminal status.
    pub async fn submit(&self, source: SourceFile) -> Result<IngestionHandle> {
        let id = Uuid::new_v4();

        let progress = IngestionProgress::new(id, source.sanitized_filename());
        self.progress.insert(id, progress.clone());
        if let Err(e) = self.catalog.journal_ingestion(&progress) {
            tracing::error!("Failed to journal ingestion {}: {}", id, e);
        }

        let (completion_tx, completion_rx) = oneshot::channel();
        let task = IngestionTask {
            id,
            source,
            completion: completion_tx,
        };
        if self.sender.send(task).await.is_err() {
            self.mark_submission_failed(id, "ingestion queue is closed");
            return Err(Error::internal("ingestion queue is closed"));
        }

        tracing::debug!("Ingestion {} queued", id);
        Ok(IngestionHandle {
            id,
            completion: completion_rx,
        })
    }

    /// Ask a queued or running ingestion to stop at its next stage boundary
    ///
    /// Returns false when the id is unknown or already terminal.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.progress.get_mut(&id) {
            Some(mut progress) if !progress.status.is_terminal() => {
                progress.cancel_requested = true;
                tracing::info!("Cancellation requested for ingestion {}", id);
                true
            }
            _ => false,
        }
    }

    /// Get live progress for one ingestion
    pub fn progress(&self, id: Uuid) -> Option<IngestionProgress> {
        self.progress.get(&id).map(|p| p.clone())
    }

    /// Snapshot of every ingestion this process has seen
    pub fn list(&self) -> Vec<IngestionProgress> {
        self.progress.iter().map(|e| e.value().clone()).collect()
    }

    /// Aggregate counters for operational visibility
    pub fn stats(&self) -> PipelineStats {
        let mut stats = PipelineStats {
            worker_count: self.worker_count,
            ..Default::default()
        };
        for entry in self.progress.iter() {
            stats.total += 1;
            match entry.status {
                IngestionStatus::Queued => stats.queued += 1,
                IngestionStatus::Running => stats.running += 1,
                IngestionStatus::Completed => stats.completed += 1,
                IngestionStatus::CompletedWithWarnings => stats.completed_with_warnings += 1,
                IngestionStatus::Rejected => stats.rejected += 1,
                IngestionStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Get the progress registry for the worker pool
    pub fn progress_ref(&self) -> Arc<DashMap<Uuid, IngestionProgress>> {
        self.progress.clone()
    }

    fn mark_submission_failed(&self, id: Uuid, message: &str) {
        if let Some(mut progress) = self.progress.get_mut(&id) {
            progress.status = IngestionStatus::Failed;
            progress.error = Some(message.to_string());
            progress.completed_at = Some(chrono::Utc::now());
            let snapshot = progress.clone();
            drop(progress); // Release the map entry before the catalog write
            if let Err(e) = self.catalog.journal_ingestion(&snapshot) {
                tracing::error!("Failed to journal ingestion {}: {}", id, e);
            }
        }
    }
}

/// Aggregate pipeline counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub completed_with_warnings: usize,
    pub rejected: usize,
    pub failed: usize,
    pub worker_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_pipeline() -> (IngestionPipeline, mpsc::Receiver<IngestionTask>, Arc<CatalogDb>) {
        let config = MemoriesConfig::default();
        let catalog = Arc::new(CatalogDb::in_memory().unwrap());
        let (pipeline, receiver) = IngestionPipeline::new(&config, catalog.clone());
        (pipeline, receiver, catalog)
    }

    fn source(name: &str) -> SourceFile {
        SourceFile::new(Bytes::from_static(b"payload"), Some(name.to_string()), None)
    }

    #[tokio::test]
    async fn submit_registers_progress_and_journals() {
        let (pipeline, mut receiver, catalog) = test_pipeline();

        let handle = pipeline.submit(source("a.png")).await.unwrap();
        let id = handle.id;

        let progress = pipeline.progress(id).unwrap();
        assert_eq!(progress.status, IngestionStatus::Queued);
        assert_eq!(progress.filename.as_deref(), Some("a.png"));

        let record = catalog.get_ingestion(id).unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Queued);

        let task = receiver.recv().await.unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn cancel_flags_live_ingestions_only() {
        let (pipeline, _receiver, _catalog) = test_pipeline();

        let handle = pipeline.submit(source("b.png")).await.unwrap();
        assert!(pipeline.cancel(handle.id));
        assert!(pipeline.progress(handle.id).unwrap().cancel_requested);

        // Unknown ids and terminal attempts are not cancellable
        assert!(!pipeline.cancel(Uuid::new_v4()));
        pipeline
            .progress_ref()
            .get_mut(&handle.id)
            .unwrap()
            .status = IngestionStatus::Completed;
        assert!(!pipeline.cancel(handle.id));
    }

    #[tokio::test]
    async fn closed_queue_fails_the_submission() {
        let (pipeline, receiver, catalog) = test_pipeline();
        drop(receiver);

        let err = pipeline.submit(source("c.png")).await.unwrap_err();
        assert!(err.to_string().contains("queue is closed"));

        let failed: Vec<_> = pipeline
            .list()
            .into_iter()
            .filter(|p| p.status == IngestionStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        let record = catalog.get_ingestion(failed[0].id).unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Failed);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let (pipeline, _receiver, _catalog) = test_pipeline();

        let a = pipeline.submit(source("a.png")).await.unwrap();
        let _b = pipeline.submit(source("b.png")).await.unwrap();
        pipeline.progress_ref().get_mut(&a.id).unwrap().status = IngestionStatus::Rejected;

        let stats = pipeline.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.rejected, 1);
    }
}

//! Background worker pool driving ingestions to a terminal status
//!
//! Every task runs the same stage machine: size gate, detect, extract,
//! normalize, address, store. Stage boundaries double as cancellation
//! points, and each stage runs under its own time budget so one stuck
//! decode cannot hold a worker slot forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use crate::address::{digest_bytes, DigestLocks};
use crate::config::MemoriesConfig;
use crate::detect::{self, SourceHint, DETECT_PREFIX_LEN};
use crate::error::{Error, Result};
use crate::extract::ExtractorSet;
use crate::normalize::normalize;
use crate::storage::{CatalogDb, StorageOrchestrator, StoreOutcome, StoreRequest};
use crate::types::{
    CompletionEvent, IngestionProgress, IngestionStage, IngestionStatus, SourceFile,
};

use super::coordinator::IngestionTask;

/// Worker pool for queued ingestions
pub struct IngestWorker {
    progress: Arc<DashMap<Uuid, IngestionProgress>>,
    catalog: Arc<CatalogDb>,
    orchestrator: Arc<StorageOrchestrator>,
    extractors: ExtractorSet,
    digest_locks: Arc<DigestLocks>,
    parallel_ingestions: usize,
    detect_timeout: Duration,
    extract_timeout: Duration,
    store_timeout: Duration,
    max_input_bytes: u64,
}

impl IngestWorker {
    pub fn new(
        config: &MemoriesConfig,
        progress: Arc<DashMap<Uuid, IngestionProgress>>,
        catalog: Arc<CatalogDb>,
        orchestrator: Arc<StorageOrchestrator>,
    ) -> Self {
        let parallel_ingestions = config.pipeline.effective_workers();
        tracing::info!(
            "Ingest worker configured: {} parallel ingestions, {} decode permits, {}s extract budget",
            parallel_ingestions,
            config.pipeline.effective_page_decode_permits(),
            config.pipeline.extract_timeout_secs
        );

        Self {
            progress,
            catalog,
            orchestrator,
            extractors: ExtractorSet::new(config.pipeline.effective_page_decode_permits()),
            digest_locks: DigestLocks::new(),
            parallel_ingestions,
            detect_timeout: config.pipeline.detect_timeout(),
            extract_timeout: config.pipeline.extract_timeout(),
            store_timeout: config.pipeline.store_timeout(),
            max_input_bytes: config.extraction.max_input_bytes as u64,
        }
    }

    /// Drain the submission channel until it closes
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<IngestionTask>) {
        tracing::info!(
            "Ingest worker started: {} parallel ingestions",
            self.parallel_ingestions
        );

        let semaphore = Arc::new(Semaphore::new(self.parallel_ingestions));
        while let Some(task) = receiver.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            tokio::spawn(async move {
                worker.process_one(task).await;
                drop(permit);
            });
        }

        tracing::info!("Ingest worker stopped: submission channel closed");
    }

    async fn process_one(&self, task: IngestionTask) {
        let IngestionTask {
            id,
            source,
            completion,
        } = task;
        tracing::info!(
            "Ingestion {} started ({} bytes, {})",
            id,
            source.size(),
            source.filename.as_deref().unwrap_or("unnamed")
        );

        self.mark_running(id);
        let started = std::time::Instant::now();
        let result = self.run_stages(id, &source).await;
        let event = self.finish(id, result);

        match event.status {
            IngestionStatus::Completed | IngestionStatus::CompletedWithWarnings => {
                tracing::info!(
                    "Ingestion {} {} in {:.1}s",
                    id,
                    event.status,
                    started.elapsed().as_secs_f64()
                );
            }
            IngestionStatus::Rejected => {
                tracing::warn!(
                    "Ingestion {} rejected: {}",
                    id,
                    event.error.as_deref().unwrap_or("unknown")
                );
            }
            _ => {
                tracing::error!(
                    "Ingestion {} failed: {}",
                    id,
                    event.error.as_deref().unwrap_or("unknown")
                );
            }
        }

        if completion.send(event).is_err() {
            tracing::debug!("Ingestion {} completion receiver dropped", id);
        }
    }

    async fn run_stages(&self, id: Uuid, source: &SourceFile) -> Result<StoreOutcome> {
        if source.size() > self.max_input_bytes {
            return Err(Error::InputTooLarge {
                bytes: source.size(),
                limit: self.max_input_bytes,
            });
        }

        self.check_cancelled(id)?;
        self.advance(id, IngestionStage::Detecting);
        let format = self
            .with_stage_timeout("detect", self.detect_timeout, async {
                let prefix = &source.bytes[..source.bytes.len().min(DETECT_PREFIX_LEN)];
                Ok(detect::detect(prefix, Some(&SourceHint::from_source(source))))
            })
            .await?;
        if !format.is_supported() {
            return Err(Error::UnsupportedFormat {
                hint: source
                    .filename
                    .clone()
                    .or_else(|| source.declared_mime.clone()),
            });
        }
        tracing::debug!("Ingestion {} detected as {}", id, format.label());

        self.check_cancelled(id)?;
        self.advance(id, IngestionStage::Extracting);
        let extraction = self
            .with_stage_timeout(
                "extract",
                self.extract_timeout,
                self.extractors.extract(format, source),
            )
            .await?;
        let warnings = extraction.warnings.clone();
        if !warnings.is_empty() {
            self.record_warnings(id, &warnings);
        }

        self.check_cancelled(id)?;
        self.advance(id, IngestionStage::Normalizing);
        let document = self
            .with_stage_timeout("normalize", self.extract_timeout, async {
                tokio::task::spawn_blocking(move || normalize(format, &extraction))
                    .await
                    .map_err(|e| Error::internal(format!("Task join error: {}", e)))?
            })
            .await?;

        self.check_cancelled(id)?;
        self.advance(id, IngestionStage::Addressing);
        let (document, canonical, digest) = tokio::task::spawn_blocking(move || {
            let canonical = document.to_canonical_bytes()?;
            let digest = digest_bytes(&canonical);
            Ok::<_, Error>((document, canonical, digest))
        })
        .await
        .map_err(|e| Error::internal(format!("Task join error: {}", e)))??;
        tracing::debug!("Ingestion {} addressed as {}", id, digest);

        // Writers of the same digest run one at a time; the guard stays held
        // through the store stage.
        let _guard = self.digest_locks.acquire(&digest).await;
        self.check_cancelled(id)?;
        self.advance(id, IngestionStage::Storing);
        let request = StoreRequest {
            digest: &digest,
            canonical_bytes: &canonical,
            document: &document,
            source_filename: source.sanitized_filename(),
            declared_mime: source.declared_mime.clone(),
            warnings,
        };
        // A timeout here can abandon a pending reservation; the orphan sweep
        // reclaims it.
        self.with_stage_timeout("store", self.store_timeout, self.orchestrator.store(request))
            .await
    }

    /// Record the terminal state, journal it, and build the completion event
    fn finish(&self, id: Uuid, result: Result<StoreOutcome>) -> CompletionEvent {
        let Some(mut progress) = self.progress.get_mut(&id) else {
            tracing::error!("Ingestion {} has no progress entry to finish", id);
            return CompletionEvent {
                ingestion_id: id,
                status: IngestionStatus::Failed,
                content_address: None,
                warnings: Vec::new(),
                error: Some("progress entry missing".to_string()),
            };
        };

        progress.completed_at = Some(chrono::Utc::now());
        match result {
            Ok(outcome) => {
                progress.stage = IngestionStage::Done;
                progress.content_address = Some(outcome.address().clone());
                // A dedup hit keeps this attempt's own extraction warnings
                if let StoreOutcome::Stored { warnings, .. } = outcome {
                    progress.warnings = warnings;
                }
                progress.status = if progress.warnings.is_empty() {
                    IngestionStatus::Completed
                } else {
                    IngestionStatus::CompletedWithWarnings
                };
            }
            Err(e) => {
                progress.status = if e.is_rejection() {
                    IngestionStatus::Rejected
                } else {
                    IngestionStatus::Failed
                };
                progress.error = Some(e.to_string());
            }
        }

        let snapshot = progress.clone();
        drop(progress); // Release the map entry before the catalog write
        if let Err(e) = self.catalog.journal_ingestion(&snapshot) {
            tracing::error!("Failed to journal ingestion {}: {}", id, e);
        }

        CompletionEvent {
            ingestion_id: id,
            status: snapshot.status,
            content_address: snapshot.content_address,
            warnings: snapshot.warnings,
            error: snapshot.error,
        }
    }

    fn mark_running(&self, id: Uuid) {
        if let Some(mut progress) = self.progress.get_mut(&id) {
            progress.status = IngestionStatus::Running;
        }
    }

    /// Move the live stage marker; only terminal states reach the journal
    fn advance(&self, id: Uuid, stage: IngestionStage) {
        if let Some(mut progress) = self.progress.get_mut(&id) {
            progress.stage = stage;
        }
    }

    fn record_warnings(&self, id: Uuid, warnings: &[String]) {
        if let Some(mut progress) = self.progress.get_mut(&id) {
            progress.warnings.extend(warnings.iter().cloned());
        }
    }

    fn check_cancelled(&self, id: Uuid) -> Result<()> {
        match self.progress.get(&id) {
            Some(progress) if progress.cancel_requested => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    async fn with_stage_timeout<T>(
        &self,
        stage: &'static str,
        budget: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StageTimeout {
                stage,
                secs: budget.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IngestionPipeline;
    use crate::providers::{BlobInfo, BlobStoreProvider, LocalBlobStore, ObjectDirEntry};
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::ImageFormat;
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([40, 90, 160]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn png_source(name: &str) -> SourceFile {
        SourceFile::new(png_bytes(), Some(name.to_string()), None)
    }

    fn build_rig(
        mut config: MemoriesConfig,
        blob_store: Option<Arc<dyn BlobStoreProvider>>,
    ) -> (
        tempfile::TempDir,
        IngestionPipeline,
        mpsc::Receiver<IngestionTask>,
        Arc<IngestWorker>,
        Arc<CatalogDb>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        config.storage.root_dir = dir.path().to_path_buf();

        let catalog = Arc::new(CatalogDb::in_memory().unwrap());
        let blob_store = blob_store
            .unwrap_or_else(|| Arc::new(LocalBlobStore::new(&config.storage).unwrap()));
        let orchestrator = Arc::new(StorageOrchestrator::new(
            &config,
            catalog.clone(),
            blob_store,
        ));
        let (pipeline, receiver) = IngestionPipeline::new(&config, catalog.clone());
        let worker = Arc::new(IngestWorker::new(
            &config,
            pipeline.progress_ref(),
            catalog.clone(),
            orchestrator,
        ));
        (dir, pipeline, receiver, worker, catalog)
    }

    fn spawn_rig(
        config: MemoriesConfig,
        blob_store: Option<Arc<dyn BlobStoreProvider>>,
    ) -> (tempfile::TempDir, IngestionPipeline, Arc<CatalogDb>) {
        let (dir, pipeline, receiver, worker, catalog) = build_rig(config, blob_store);
        tokio::spawn(worker.run(receiver));
        (dir, pipeline, catalog)
    }

    #[tokio::test]
    async fn png_ingestion_completes_end_to_end() {
        let (_dir, pipeline, catalog) = spawn_rig(MemoriesConfig::default(), None);

        let handle = pipeline.submit(png_source("photo.png")).await.unwrap();
        let id = handle.id;
        let event = handle.wait().await.unwrap();

        assert_eq!(event.status, IngestionStatus::Completed);
        let address = event.content_address.unwrap();
        assert_eq!(address.digest.len(), 64);

        let progress = pipeline.progress(id).unwrap();
        assert_eq!(progress.stage, IngestionStage::Done);
        assert!(progress.completed_at.is_some());

        let record = catalog.get_ingestion(id).unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Completed);
        assert_eq!(record.digest.as_deref(), Some(address.digest.as_str()));
    }

    #[tokio::test]
    async fn duplicate_submissions_share_one_object() {
        let (_dir, pipeline, catalog) = spawn_rig(MemoriesConfig::default(), None);

        let first = pipeline.submit(png_source("a.png")).await.unwrap();
        let first = first.wait().await.unwrap();
        let second = pipeline.submit(png_source("b.png")).await.unwrap();
        let second = second.wait().await.unwrap();

        assert_eq!(first.content_address, second.content_address);
        let stats = catalog.stats().unwrap();
        assert_eq!(stats.total_objects, 1);
    }

    #[tokio::test]
    async fn unrecognized_bytes_are_rejected() {
        let (_dir, pipeline, catalog) = spawn_rig(MemoriesConfig::default(), None);

        let source = SourceFile::new(
            Bytes::from_static(b"no known signature here"),
            Some("mystery.bin".to_string()),
            None,
        );
        let handle = pipeline.submit(source).await.unwrap();
        let event = handle.wait().await.unwrap();

        assert_eq!(event.status, IngestionStatus::Rejected);
        assert!(event.error.unwrap().contains("Unsupported"));
        let record = catalog.get_ingestion(event.ingestion_id).unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Rejected);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_before_decoding() {
        let mut config = MemoriesConfig::default();
        config.extraction.max_input_bytes = 16;
        let (_dir, pipeline, _catalog) = spawn_rig(config, None);

        let handle = pipeline.submit(png_source("big.png")).await.unwrap();
        let event = handle.wait().await.unwrap();

        assert_eq!(event.status, IngestionStatus::Rejected);
        assert!(event.error.unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn cancellation_before_start_stores_nothing() {
        let (_dir, pipeline, receiver, worker, catalog) =
            build_rig(MemoriesConfig::default(), None);

        // Flag the cancel while the task is still queued, then let the
        // worker pick it up.
        let handle = pipeline.submit(png_source("photo.png")).await.unwrap();
        assert!(pipeline.cancel(handle.id));
        tokio::spawn(worker.run(receiver));

        let event = handle.wait().await.unwrap();
        assert_eq!(event.status, IngestionStatus::Failed);
        assert!(event.error.unwrap().contains("cancelled"));
        assert_eq!(catalog.stats().unwrap().total_objects, 0);
    }

    struct HangingBlobStore;

    #[async_trait]
    impl BlobStoreProvider for HangingBlobStore {
        async fn put(&self, _key: &str, _data: &[u8]) -> Result<u64> {
            std::future::pending().await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            Err(Error::NotFound(key.to_string()))
        }

        async fn head(&self, _key: &str) -> Result<Option<BlobInfo>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_object_dir(&self, _dir_key: &str) -> Result<()> {
            Ok(())
        }

        async fn list_object_dirs(&self) -> Result<Vec<ObjectDirEntry>> {
            Ok(Vec::new())
        }

        async fn sweep_partials(&self, _older_than: std::time::SystemTime) -> Result<usize> {
            Ok(0)
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn stuck_store_stage_times_out() {
        let mut config = MemoriesConfig::default();
        config.pipeline.store_timeout_secs = 1;
        let (_dir, pipeline, catalog) = spawn_rig(config, Some(Arc::new(HangingBlobStore)));

        let handle = pipeline.submit(png_source("photo.png")).await.unwrap();
        let event = handle.wait().await.unwrap();

        assert_eq!(event.status, IngestionStatus::Failed);
        assert!(event.error.unwrap().contains("timed out"));
        // The abandoned reservation stays pending until the sweep reclaims it
        assert_eq!(catalog.stats().unwrap().pending_reservations, 1);
    }
}

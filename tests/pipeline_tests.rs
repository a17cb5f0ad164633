//! End-to-end pipeline behavior over a real storage root
//!
//! Each test wires the full stack the daemon runs: file-backed catalog,
//! local blob store (optionally wrapped for fault injection), orchestrator,
//! pipeline front door, and the worker pool.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use image::ImageFormat;
use memories::config::MemoriesConfig;
use memories::pipeline::{IngestWorker, IngestionPipeline};
use memories::providers::{BlobInfo, BlobStoreProvider, LocalBlobStore, ObjectDirEntry};
use memories::storage::{CatalogDb, StorageOrchestrator};
use memories::{Error, IngestionStatus, Result, SourceFile, StagingWatcher};
use zip::write::SimpleFileOptions;

struct Rig {
    root: tempfile::TempDir,
    pipeline: Arc<IngestionPipeline>,
    catalog: Arc<CatalogDb>,
    orchestrator: Arc<StorageOrchestrator>,
}

fn start_rig(
    mut config: MemoriesConfig,
    wrap: impl FnOnce(Arc<dyn BlobStoreProvider>) -> Arc<dyn BlobStoreProvider>,
) -> Rig {
    let root = tempfile::tempdir().unwrap();
    config.storage.root_dir = root.path().join("store");

    let catalog = Arc::new(CatalogDb::new(config.storage.catalog_path()).unwrap());
    let local: Arc<dyn BlobStoreProvider> =
        Arc::new(LocalBlobStore::new(&config.storage).unwrap());
    let blob_store = wrap(local);
    let orchestrator = Arc::new(StorageOrchestrator::new(
        &config,
        catalog.clone(),
        blob_store,
    ));
    let (pipeline, receiver) = IngestionPipeline::new(&config, catalog.clone());
    let pipeline = Arc::new(pipeline);
    let worker = Arc::new(IngestWorker::new(
        &config,
        pipeline.progress_ref(),
        catalog.clone(),
        orchestrator.clone(),
    ));
    tokio::spawn(worker.run(receiver));

    Rig {
        root,
        pipeline,
        catalog,
        orchestrator,
    }
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([12, 140, 210]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// EPUB whose spine lists two chapters but whose archive carries only one
fn epub_with_missing_chapter() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    zip.start_file("META-INF/container.xml", stored).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/content.opf", stored).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Field Notes</dc:title>
    <dc:creator>R. Mapmaker</dc:creator>
  </metadata>
  <manifest>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine><itemref idref="ch1"/><itemref idref="ch2"/></spine>
</package>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/ch1.xhtml", stored).unwrap();
    zip.write_all(
        b"<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>The surviving chapter.</p></body></html>",
    )
    .unwrap();

    zip.finish().unwrap().into_inner()
}

fn count_object_dirs(root: &Path) -> usize {
    let blobs = root.join("store").join("blobs");
    let mut dirs = 0;
    if let Ok(shards) = std::fs::read_dir(&blobs) {
        for shard in shards.flatten() {
            if let Ok(objects) = std::fs::read_dir(shard.path()) {
                dirs += objects.flatten().count();
            }
        }
    }
    dirs
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..250 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within the polling budget");
}

/// Wraps the local store, failing the first `failures_left` writes and
/// counting the content-blob writes that go through
struct FlakyStore {
    inner: Arc<dyn BlobStoreProvider>,
    failures_left: AtomicU32,
    content_writes: AtomicU32,
}

impl FlakyStore {
    fn wrapping(inner: Arc<dyn BlobStoreProvider>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicU32::new(failures),
            content_writes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl BlobStoreProvider for FlakyStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient("injected write failure"));
        }
        let written = self.inner.put(key, data).await?;
        if key.ends_with("content.json") {
            self.content_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<Option<BlobInfo>> {
        self.inner.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_object_dir(&self, dir_key: &str) -> Result<()> {
        self.inner.delete_object_dir(dir_key).await
    }

    async fn list_object_dirs(&self) -> Result<Vec<ObjectDirEntry>> {
        self.inner.list_object_dirs().await
    }

    async fn sweep_partials(&self, older_than: SystemTime) -> Result<usize> {
        self.inner.sweep_partials(older_than).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn magic_detection_overrides_wrong_extension() {
    let rig = start_rig(MemoriesConfig::default(), |store| store);

    // PNG bytes wearing a JPEG name and MIME type
    let source = SourceFile::new(
        png_bytes(),
        Some("vacation.jpg".to_string()),
        Some("image/jpeg".to_string()),
    );
    let event = rig.pipeline.submit(source).await.unwrap().wait().await.unwrap();

    assert_eq!(event.status, IngestionStatus::Completed);
    let address = event.content_address.unwrap();
    let object = rig.catalog.get_object(address.id).unwrap().unwrap();
    assert_eq!(object.original_format, "png");
    assert_eq!(object.source_filename.as_deref(), Some("vacation.jpg"));
}

#[tokio::test]
async fn identical_content_resolves_to_one_object() {
    let rig = start_rig(MemoriesConfig::default(), |store| store);

    let first = rig
        .pipeline
        .submit(SourceFile::new(png_bytes(), Some("a.png".to_string()), None))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = rig
        .pipeline
        .submit(SourceFile::new(png_bytes(), Some("b.png".to_string()), None))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let first_address = first.content_address.unwrap();
    let second_address = second.content_address.unwrap();
    assert_eq!(first_address, second_address);

    let object = rig.catalog.get_object(first_address.id).unwrap().unwrap();
    assert_eq!(object.ref_count, 2);
    assert_eq!(rig.catalog.stats().unwrap().total_objects, 1);
    assert_eq!(count_object_dirs(rig.root.path()), 1);
}

#[tokio::test]
async fn digests_are_deterministic_across_independent_stores() {
    let first_rig = start_rig(MemoriesConfig::default(), |store| store);
    let second_rig = start_rig(MemoriesConfig::default(), |store| store);

    let source = || SourceFile::new(png_bytes(), Some("photo.png".to_string()), None);
    let first = first_rig
        .pipeline
        .submit(source())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let second = second_rig
        .pipeline
        .submit(source())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Same content digest even though the object ids differ per store
    assert_eq!(
        first.content_address.unwrap().digest,
        second.content_address.unwrap().digest
    );
}

#[tokio::test]
async fn partial_epub_completes_with_warnings() {
    let rig = start_rig(MemoriesConfig::default(), |store| store);

    let source = SourceFile::new(epub_with_missing_chapter(), Some("notes.epub".to_string()), None);
    let event = rig.pipeline.submit(source).await.unwrap().wait().await.unwrap();

    assert_eq!(event.status, IngestionStatus::CompletedWithWarnings);
    assert!(event.warnings.iter().any(|w| w.contains("unreadable")));

    // The readable chapter was persisted
    let address = event.content_address.unwrap();
    let document = rig.orchestrator.load_document(&address).await.unwrap();
    assert_eq!(document.page_count(), 1);
    assert_eq!(document.original_format, "epub");
}

#[tokio::test]
async fn transient_store_failure_retries_to_success() {
    let mut config = MemoriesConfig::default();
    config.storage.retry_base_delay_ms = 1;
    config.storage.retry_max_delay_ms = 2;

    let mut flaky = None;
    let rig = start_rig(config, |store| {
        let wrapped = FlakyStore::wrapping(store, 1);
        flaky = Some(wrapped.clone());
        wrapped
    });
    let flaky = flaky.unwrap();

    let event = rig
        .pipeline
        .submit(SourceFile::new(png_bytes(), Some("photo.png".to_string()), None))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(event.status, IngestionStatus::Completed);
    assert_eq!(flaky.content_writes.load(Ordering::SeqCst), 1);
    assert_eq!(rig.catalog.stats().unwrap().total_objects, 1);
    assert_eq!(rig.catalog.stats().unwrap().pending_reservations, 0);

    // Nothing half-written left behind
    let tmp = rig.root.path().join("store").join("tmp");
    assert_eq!(std::fs::read_dir(tmp).unwrap().count(), 0);
}

#[tokio::test]
async fn exhausted_store_leaves_the_staging_entry() {
    let mut config = MemoriesConfig::default();
    config.storage.retry_max_attempts = 2;
    config.storage.retry_base_delay_ms = 1;
    config.storage.retry_max_delay_ms = 2;
    config.staging.settle_secs = 0;

    let rig = start_rig(config.clone(), |store| {
        FlakyStore::wrapping(store, u32::MAX)
    });

    let staging_dir = tempfile::tempdir().unwrap();
    let watcher = Arc::new(
        StagingWatcher::new(
            staging_dir.path().to_path_buf(),
            &config.staging,
            rig.pipeline.clone(),
        )
        .unwrap(),
    );
    let staged = staging_dir.path().join("photo.png");
    std::fs::write(&staged, png_bytes()).unwrap();

    assert_eq!(watcher.scan_once().await, 1);

    let pipeline = rig.pipeline.clone();
    wait_until(move || {
        pipeline
            .list()
            .first()
            .map(|p| p.status == IngestionStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    // The failed attempt keeps the file so a later scan can retry it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(staged.exists());
    assert_eq!(rig.catalog.stats().unwrap().total_objects, 0);
}

#[tokio::test]
async fn concurrent_identical_submissions_store_once() {
    let mut flaky = None;
    let rig = start_rig(MemoriesConfig::default(), |store| {
        let wrapped = FlakyStore::wrapping(store, 0);
        flaky = Some(wrapped.clone());
        wrapped
    });
    let flaky = flaky.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let source = SourceFile::new(png_bytes(), Some(format!("copy-{i}.png")), None);
        handles.push(rig.pipeline.submit(source).await.unwrap());
    }

    let events = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
    let mut digests = std::collections::HashSet::new();
    for event in events {
        let event = event.unwrap();
        assert!(event.status.is_stored());
        digests.insert(event.content_address.unwrap().digest);
    }

    assert_eq!(digests.len(), 1);
    assert_eq!(flaky.content_writes.load(Ordering::SeqCst), 1);

    let stats = rig.catalog.stats().unwrap();
    assert_eq!(stats.total_objects, 1);
    assert_eq!(stats.pending_reservations, 0);
    assert_eq!(count_object_dirs(rig.root.path()), 1);

    let object = rig
        .catalog
        .get_object_by_digest(digests.iter().next().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(object.ref_count, 50);
}

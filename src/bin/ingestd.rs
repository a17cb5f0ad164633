//! Ingestion daemon binary
//!
//! Run with: cargo run --bin memories-ingestd [config.toml]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memories::config::MemoriesConfig;
use memories::pipeline::{IngestWorker, IngestionPipeline};
use memories::providers::{BlobStoreProvider, LocalBlobStore};
use memories::staging::StagingWatcher;
use memories::storage::{CatalogDb, StorageOrchestrator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memories=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!(
        r#"
╔═══════════════════════════════════════════════════════════╗
║                     Memories Ingestd                      ║
║      Content-addressed ingestion for personal files       ║
╚═══════════════════════════════════════════════════════════╝
"#
    );

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = MemoriesConfig::load(config_path.as_deref())?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Storage root: {}", config.storage.root_dir.display());
    tracing::info!("  - Workers: {}", config.pipeline.effective_workers());
    tracing::info!(
        "  - Input size cap: {} bytes",
        config.extraction.max_input_bytes
    );

    // Open the catalog and blob store
    let catalog = Arc::new(CatalogDb::new(config.storage.catalog_path())?);
    let blob_store: Arc<dyn BlobStoreProvider> = Arc::new(LocalBlobStore::new(&config.storage)?);
    match blob_store.health_check().await {
        Ok(true) => tracing::info!("Blob store '{}' is healthy", blob_store.name()),
        _ => tracing::warn!("Blob store '{}' failed its health check", blob_store.name()),
    }

    let stats = catalog.stats()?;
    tracing::info!(
        "Catalog ready: {} object(s), {} blob byte(s), {} pending reservation(s)",
        stats.total_objects,
        stats.total_blob_bytes,
        stats.pending_reservations
    );

    // Storage orchestration; the first sweep pass runs immediately and
    // reclaims anything a previous run abandoned
    let orchestrator = Arc::new(StorageOrchestrator::new(
        &config,
        catalog.clone(),
        blob_store,
    ));
    orchestrator.spawn_sweeper(Duration::from_secs(config.storage.orphan_sweep_interval_secs));

    // Pipeline front door and worker pool
    let (pipeline, receiver) = IngestionPipeline::new(&config, catalog.clone());
    let pipeline = Arc::new(pipeline);
    let worker = Arc::new(IngestWorker::new(
        &config,
        pipeline.progress_ref(),
        catalog.clone(),
        orchestrator.clone(),
    ));
    tokio::spawn(worker.run(receiver));

    // Staging intake, when configured
    match config.staging.dir.clone() {
        Some(dir) => {
            let watcher = Arc::new(StagingWatcher::new(dir, &config.staging, pipeline.clone())?);
            watcher.spawn();
        }
        None => {
            tracing::info!("No staging directory configured; only programmatic submissions");
        }
    }

    println!("\nIngest daemon running. Press Ctrl+C to stop.\n");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}

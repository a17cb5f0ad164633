//! Staging directory intake
//!
//! Files dropped into the staging directory are picked up by a periodic
//! scan and fed through the pipeline. A file is deleted only after its
//! ingestion reaches a journaled terminal status; failed attempts keep the
//! file so a later scan retries it, and a crash mid-ingestion leaves the
//! file in place for reprocessing on restart (deduplication makes the
//! second pass harmless).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::StagingConfig;
use crate::error::Result;
use crate::pipeline::{IngestionHandle, IngestionPipeline};
use crate::types::{IngestionStatus, SourceFile};

/// Periodic scanner over the staging directory
pub struct StagingWatcher {
    pipeline: Arc<IngestionPipeline>,
    dir: PathBuf,
    settle: Duration,
    scan_interval: Duration,
    /// Paths submitted and not yet terminal, so overlapping scans skip them
    in_flight: Arc<DashMap<PathBuf, Uuid>>,
}

impl StagingWatcher {
    pub fn new(
        dir: PathBuf,
        config: &StagingConfig,
        pipeline: Arc<IngestionPipeline>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            pipeline,
            dir,
            settle: config.settle_window(),
            scan_interval: config.scan_interval(),
            in_flight: Arc::new(DashMap::new()),
        })
    }

    /// Scan on an interval until the task is aborted
    ///
    /// The first scan runs immediately, which is what reprocesses files left
    /// over from a previous run.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Staging watcher started on {}", watcher.dir.display());
            let mut ticker = tokio::time::interval(watcher.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                watcher.scan_once().await;
            }
        })
    }

    /// One pass over the staging directory; returns how many files were
    /// queued
    pub async fn scan_once(&self) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(self.settle)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut submitted = 0;
        for entry in WalkDir::new(&self.dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || is_hidden(path) {
                continue;
            }
            let settling = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(|modified| modified > cutoff)
                .unwrap_or(true);
            if settling || self.in_flight.contains_key(path) {
                continue;
            }

            match self.submit_staged(path.to_path_buf()).await {
                Ok(()) => submitted += 1,
                Err(e) => {
                    tracing::warn!("Staged file {} not submitted: {}", path.display(), e);
                }
            }
        }

        if submitted > 0 {
            tracing::info!("Staging scan queued {} file(s)", submitted);
        }
        submitted
    }

    async fn submit_staged(&self, path: PathBuf) -> Result<()> {
        let bytes = tokio::fs::read(&path).await?;
        let source = SourceFile::from_staging(path.clone(), bytes);
        let handle = self.pipeline.submit(source).await?;
        self.in_flight.insert(path.clone(), handle.id);
        tracing::info!(
            "Staged file {} submitted as ingestion {}",
            path.display(),
            handle.id
        );

        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            Self::finish_staged(path, handle, in_flight).await;
        });
        Ok(())
    }

    /// Delete the staged file once its terminal status is journaled
    ///
    /// Stored and rejected outcomes remove the file; rejection is recorded in
    /// the journal, and keeping the file would only make every later scan
    /// reject it again. Failures keep the file for retry.
    async fn finish_staged(
        path: PathBuf,
        handle: IngestionHandle,
        in_flight: Arc<DashMap<PathBuf, Uuid>>,
    ) {
        let id = handle.id;
        match handle.wait().await {
            Ok(event)
                if event.status.is_stored() || event.status == IngestionStatus::Rejected =>
            {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Staged file {} not removed: {}", path.display(), e);
                }
            }
            Ok(_) => {
                tracing::warn!(
                    "Staged file {} kept for retry (ingestion {} failed)",
                    path.display(),
                    id
                );
            }
            Err(e) => {
                tracing::error!(
                    "Completion for staged file {} was lost: {}",
                    path.display(),
                    e
                );
            }
        }
        in_flight.remove(&path);
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

//! Storage orchestration: reserve, write blob, commit, sweep
//!
//! Write ordering is fixed: reserve the digest, write the blob, then flip
//! the reservation to committed together with the object record. A crash at
//! any point leaves either a pending reservation or an unreferenced blob
//! directory, both of which the orphan sweep reclaims after a grace window.

use chrono::Utc;
use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use ulid::Ulid;

use crate::config::MemoriesConfig;
use crate::error::{Error, Result};
use crate::providers::BlobStoreProvider;
use crate::types::{meta_keys, ContentAddress, NormalizedDocument, PageImage};

use super::database::{CatalogDb, DigestReservation, ObjectRecord};

/// Blob filename for the canonical document serialization
const CONTENT_BLOB: &str = "content.json";

/// Thumbnail edge lengths in pixels, rendered as WebP sidecars
const THUMBNAIL_SIZES: [(&str, u32); 3] = [("small", 100), ("medium", 150), ("large", 300)];

/// Coordinates the catalog and the blob store for the storage stage
pub struct StorageOrchestrator {
    catalog: Arc<CatalogDb>,
    blob_store: Arc<dyn BlobStoreProvider>,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    orphan_grace: Duration,
    generate_thumbnails: bool,
}

/// Everything the storage stage needs to persist one document
pub struct StoreRequest<'a> {
    /// Content digest computed during addressing
    pub digest: &'a str,
    /// Canonical serialization the digest was computed over
    pub canonical_bytes: &'a [u8],
    pub document: &'a NormalizedDocument,
    pub source_filename: Option<String>,
    pub declared_mime: Option<String>,
    /// Warnings accumulated by earlier stages, recorded on first store
    pub warnings: Vec<String>,
}

/// Result of storing one document
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// First copy of this content; a new blob was written
    Stored {
        address: ContentAddress,
        warnings: Vec<String>,
    },
    /// Content already present; the existing object was referenced
    Deduplicated {
        address: ContentAddress,
        ref_count: u32,
    },
}

impl StoreOutcome {
    pub fn address(&self) -> &ContentAddress {
        match self {
            StoreOutcome::Stored { address, .. } => address,
            StoreOutcome::Deduplicated { address, .. } => address,
        }
    }
}

/// What one orphan sweep pass reclaimed
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub stale_reservations_cleared: usize,
    pub orphan_dirs_removed: usize,
    pub partials_removed: usize,
}

impl StorageOrchestrator {
    pub fn new(
        config: &MemoriesConfig,
        catalog: Arc<CatalogDb>,
        blob_store: Arc<dyn BlobStoreProvider>,
    ) -> Self {
        Self {
            catalog,
            blob_store,
            retry_max_attempts: config.storage.retry_max_attempts,
            retry_base_delay: Duration::from_millis(config.storage.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.storage.retry_max_delay_ms),
            orphan_grace: Duration::from_secs(config.storage.orphan_grace_secs),
            generate_thumbnails: config.extraction.generate_thumbnails,
        }
    }

    /// Persist a document, deduplicating on its digest
    ///
    /// The caller must hold the in-process digest lock for
    /// `request.digest` for the whole call.
    pub async fn store(&self, request: StoreRequest<'_>) -> Result<StoreOutcome> {
        match self.catalog.reserve_digest(request.digest, Ulid::new())? {
            DigestReservation::Committed { object_id } => {
                self.resolve_hit(request.digest, object_id).await
            }
            DigestReservation::Reserved { object_id } => {
                let address = ContentAddress::new(request.digest.to_string(), object_id);
                match self.write_and_commit(&address, &request).await {
                    Ok(warnings) => Ok(StoreOutcome::Stored { address, warnings }),
                    Err(e) => {
                        self.abandon_reservation(&address).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Load a stored document and verify it against its digest
    pub async fn load_document(&self, address: &ContentAddress) -> Result<NormalizedDocument> {
        let data = self.blob_store.get(&content_key(address)).await?;
        let digest = crate::address::digest_bytes(&data);
        if digest != address.digest {
            return Err(Error::corrupt(
                "blob",
                format!(
                    "digest mismatch for {}: stored bytes hash to {}",
                    address, digest
                ),
            ));
        }
        NormalizedDocument::from_canonical_bytes(&data)
    }

    async fn resolve_hit(&self, digest: &str, object_id: Ulid) -> Result<StoreOutcome> {
        let address = ContentAddress::new(digest.to_string(), object_id);

        // A committed digest must have its blob; a miss here means the
        // catalog and the blob store disagree.
        if self.blob_store.head(&content_key(&address)).await?.is_none() {
            return Err(Error::invariant(format!(
                "committed digest {} has no blob under {}",
                digest,
                address.dir_key()
            )));
        }

        let record = self.catalog.touch_object(object_id)?;
        tracing::info!(address = %address, ref_count = record.ref_count, "dedup hit");
        Ok(StoreOutcome::Deduplicated {
            address,
            ref_count: record.ref_count,
        })
    }

    async fn write_and_commit(
        &self,
        address: &ContentAddress,
        request: &StoreRequest<'_>,
    ) -> Result<Vec<String>> {
        let blob_size = self
            .put_with_retry(&content_key(address), request.canonical_bytes)
            .await?;

        let mut warnings = request.warnings.clone();
        if self.generate_thumbnails {
            if let Some(image) = request.document.first_image() {
                self.write_thumbnails(address, image, &mut warnings).await;
            }
        }

        let now = Utc::now();
        let record = ObjectRecord {
            object_id: address.id,
            digest: address.digest.clone(),
            original_format: request.document.original_format.clone(),
            page_count: request.document.page_count(),
            blob_size,
            source_filename: request.source_filename.clone(),
            declared_mime: request.declared_mime.clone(),
            captured_at: request
                .document
                .metadata
                .get(meta_keys::CAPTURED_AT)
                .or_else(|| request.document.metadata.get(meta_keys::CREATED_AT))
                .cloned(),
            ref_count: 1,
            first_stored_at: now,
            last_seen_at: now,
            warnings: warnings.clone(),
            metadata: request.document.metadata.clone(),
        };
        self.catalog.commit_object(&record)?;

        tracing::info!(address = %address, blob_size, "object committed");
        Ok(warnings)
    }

    /// Thumbnails are best-effort sidecars; failures downgrade to warnings
    async fn write_thumbnails(
        &self,
        address: &ContentAddress,
        image: &PageImage,
        warnings: &mut Vec<String>,
    ) {
        match render_thumbnails(image).await {
            Ok(rendered) => {
                for (name, data) in rendered {
                    let key = format!("{}/{}", address.dir_key(), name);
                    if let Err(e) = self.put_with_retry(&key, &data).await {
                        warnings.push(format!("thumbnail {} not written: {}", name, e));
                    }
                }
            }
            Err(e) => warnings.push(format!("thumbnails skipped: {}", e)),
        }
    }

    async fn put_with_retry(&self, key: &str, data: &[u8]) -> Result<u64> {
        let mut delay = self.retry_base_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.blob_store.put(key, data).await {
                Ok(written) => return Ok(written),
                Err(Error::StorageExhausted { message, .. }) => {
                    return Err(Error::StorageExhausted {
                        attempts: attempt,
                        message,
                    })
                }
                Err(e) if e.is_retryable() && attempt < self.retry_max_attempts => {
                    tracing::warn!(key, attempt, error = %e, "blob write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max_delay);
                }
                Err(Error::TransientStorage(message)) => {
                    return Err(Error::StorageExhausted {
                        attempts: attempt,
                        message,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Undo a reservation whose blob write or commit failed
    async fn abandon_reservation(&self, address: &ContentAddress) {
        if let Err(e) = self.blob_store.delete_object_dir(&address.dir_key()).await {
            tracing::warn!(address = %address, error = %e, "could not remove blob dir after failed store");
        }
        if let Err(e) = self.catalog.release_reservation(&address.digest) {
            tracing::warn!(address = %address, error = %e, "could not release reservation after failed store");
        }
    }

    // ==================== Orphan Sweep ====================

    /// Reclaim leftovers from crashed or failed ingestions
    ///
    /// Handles three kinds of debris, each only past the grace window:
    /// pending reservations nobody is working on, blob directories the
    /// catalog does not know, and abandoned partial uploads.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let utc_cutoff = Utc::now() - self.orphan_grace;
        let sys_cutoff = SystemTime::now()
            .checked_sub(self.orphan_grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for stale in self.catalog.stale_reservations(utc_cutoff)? {
            // The row goes first. A takeover that beat the clear keeps its
            // refreshed reservation and its blob untouched; after a clear,
            // re-reserving the digest hands out a fresh id and a different
            // directory, so the delete below cannot hit a live writer.
            if !self
                .catalog
                .clear_stale_reservation(&stale.digest, utc_cutoff)?
            {
                continue;
            }
            let address = ContentAddress::new(stale.digest.clone(), stale.object_id);
            if let Err(e) = self.blob_store.delete_object_dir(&address.dir_key()).await {
                // The id is unreferenced now; the orphan-dir pass of a later
                // sweep picks the directory up.
                tracing::warn!(dir = %address.dir_key(), error = %e, "sweep could not remove blob dir");
            }
            report.stale_reservations_cleared += 1;
        }

        let known = self.catalog.known_object_ids()?;
        for entry in self.blob_store.list_object_dirs().await? {
            let object_id = entry.dir_key.rsplit('/').next().unwrap_or_default();
            if known.contains(object_id) || entry.modified >= sys_cutoff {
                continue;
            }
            match self.blob_store.delete_object_dir(&entry.dir_key).await {
                Ok(()) => report.orphan_dirs_removed += 1,
                Err(e) => {
                    tracing::warn!(dir = %entry.dir_key, error = %e, "sweep could not remove orphan dir")
                }
            }
        }

        report.partials_removed = self.blob_store.sweep_partials(sys_cutoff).await?;

        Ok(report)
    }

    /// Run the sweep now and then on every interval tick
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match orchestrator.sweep_orphans().await {
                    Ok(report) => {
                        let reclaimed = report.stale_reservations_cleared
                            + report.orphan_dirs_removed
                            + report.partials_removed;
                        if reclaimed > 0 {
                            tracing::info!(
                                stale_reservations = report.stale_reservations_cleared,
                                orphan_dirs = report.orphan_dirs_removed,
                                partials = report.partials_removed,
                                "orphan sweep reclaimed leftovers"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "orphan sweep failed"),
                }
            }
        })
    }
}

fn content_key(address: &ContentAddress) -> String {
    format!("{}/{}", address.dir_key(), CONTENT_BLOB)
}

async fn render_thumbnails(image: &PageImage) -> Result<Vec<(String, Vec<u8>)>> {
    let bytes = image.bytes.clone();
    tokio::task::spawn_blocking(move || render_thumbnails_sync(&bytes))
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
}

fn render_thumbnails_sync(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let source = image::load_from_memory(bytes)
        .map_err(|e| Error::internal(format!("source image not decodable: {}", e)))?;

    let mut rendered = Vec::with_capacity(THUMBNAIL_SIZES.len());
    for (label, edge) in THUMBNAIL_SIZES {
        let thumb = source.resize(edge, edge, FilterType::Lanczos3);
        let mut buf = Vec::new();
        thumb
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::WebP)
            .map_err(|e| Error::internal(format!("webp encode failed: {}", e)))?;
        rendered.push((format!("thumb_{}.webp", label), buf));
    }
    Ok(rendered)
}

//! SQLite catalog for the dedup index, object records and ingestion journal
//!
//! The dedup index is the durable putIfAbsent: one row per content digest,
//! first in `pending` state while the blob is written, flipped to
//! `committed` in the same transaction that inserts the object record.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{IngestionProgress, IngestionStage, IngestionStatus};

/// SQLite-backed catalog
pub struct CatalogDb {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of a digest reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestReservation {
    /// This ingestion owns the pending reservation and must write the blob
    Reserved { object_id: Ulid },
    /// The digest is already committed; no new blob write happens
    Committed { object_id: Ulid },
}

/// A committed object as recorded in the catalog
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub object_id: Ulid,
    pub digest: String,
    pub original_format: String,
    pub page_count: u32,
    pub blob_size: u64,
    pub source_filename: Option<String>,
    pub declared_mime: Option<String>,
    /// Capture timestamp from the document metadata, RFC 3339
    pub captured_at: Option<String>,
    /// Number of ingestions that resolved to this object
    pub ref_count: u32,
    pub first_stored_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Warnings recorded when the object was first stored
    pub warnings: Vec<String>,
    /// Canonical document metadata snapshot
    pub metadata: BTreeMap<String, String>,
}

/// A pending reservation older than the orphan grace window
#[derive(Debug, Clone)]
pub struct StaleReservation {
    pub digest: String,
    pub object_id: Ulid,
}

/// Journaled ingestion attempt
#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub id: Uuid,
    pub filename: Option<String>,
    pub status: IngestionStatus,
    pub stage: IngestionStage,
    pub digest: Option<String>,
    pub object_id: Option<Ulid>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Catalog statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogStats {
    pub total_objects: usize,
    pub total_blob_bytes: u64,
    pub pending_reservations: usize,
}

impl CatalogDb {
    /// Create or open the catalog at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open catalog: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory catalog (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory catalog: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run catalog migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        // WAL mode keeps reserve/commit cheap under concurrent workers.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        "#,
        )?;

        conn.execute_batch(
            r#"
            -- Digest reservation index; one row per unique content digest
            CREATE TABLE IF NOT EXISTS dedup_index (
                digest TEXT PRIMARY KEY,
                object_id TEXT NOT NULL,
                state TEXT NOT NULL,
                reserved_at TEXT NOT NULL,
                committed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_dedup_index_state ON dedup_index(state);
            CREATE INDEX IF NOT EXISTS idx_dedup_index_object_id ON dedup_index(object_id);

            -- Committed objects
            CREATE TABLE IF NOT EXISTS objects (
                object_id TEXT PRIMARY KEY,
                digest TEXT NOT NULL UNIQUE,
                original_format TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                blob_size INTEGER NOT NULL,
                source_filename TEXT,
                declared_mime TEXT,
                captured_at TEXT,
                ref_count INTEGER NOT NULL DEFAULT 1,
                first_stored_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                warnings TEXT,
                metadata_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_objects_captured_at ON objects(captured_at);

            -- Journal of ingestion attempts
            CREATE TABLE IF NOT EXISTS ingestions (
                id TEXT PRIMARY KEY,
                filename TEXT,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                digest TEXT,
                object_id TEXT,
                warnings TEXT,
                error TEXT,
                received_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ingestions_status ON ingestions(status);
            CREATE INDEX IF NOT EXISTS idx_ingestions_received_at ON ingestions(received_at);
        "#,
        )?;

        tracing::debug!("Catalog migrations complete");
        Ok(())
    }

    // ==================== Dedup Index Operations ====================

    /// Reserve a digest for storage, or learn that it is already committed
    ///
    /// First reservation inserts a `pending` row carrying `candidate_id`.
    /// An existing `pending` row is an abandoned reservation from a crashed
    /// run; ownership is taken over and its object id reused so the blob
    /// directory is rewritten in place rather than orphaned.
    pub fn reserve_digest(&self, digest: &str, candidate_id: Ulid) -> Result<DigestReservation> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT OR IGNORE INTO dedup_index (digest, object_id, state, reserved_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![digest, candidate_id.to_string(), now],
        )?;

        let (object_id_str, state): (String, String) = tx.query_row(
            "SELECT object_id, state FROM dedup_index WHERE digest = ?1",
            params![digest],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let object_id = Ulid::from_string(&object_id_str)
            .map_err(|e| Error::internal(format!("bad object id in dedup index: {}", e)))?;

        let reservation = if state == "committed" {
            DigestReservation::Committed { object_id }
        } else {
            tx.execute(
                "UPDATE dedup_index SET reserved_at = ?2 WHERE digest = ?1 AND state = 'pending'",
                params![digest, now],
            )?;
            DigestReservation::Reserved { object_id }
        };

        tx.commit()?;
        Ok(reservation)
    }

    /// Flip a pending reservation to committed and insert the object record
    ///
    /// Both writes happen in one transaction, so the catalog never shows a
    /// committed digest without its object or the reverse.
    pub fn commit_object(&self, record: &ObjectRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let flipped = tx.execute(
            "UPDATE dedup_index SET state = 'committed', committed_at = ?2
             WHERE digest = ?1 AND state = 'pending'",
            params![record.digest, Utc::now().to_rfc3339()],
        )?;
        if flipped == 0 {
            return Err(Error::invariant(format!(
                "commit without a pending reservation for digest {}",
                record.digest
            )));
        }

        tx.execute(
            r#"
            INSERT INTO objects (
                object_id, digest, original_format, page_count, blob_size,
                source_filename, declared_mime, captured_at, ref_count,
                first_stored_at, last_seen_at, warnings, metadata_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.object_id.to_string(),
                record.digest,
                record.original_format,
                record.page_count as i64,
                record.blob_size as i64,
                record.source_filename,
                record.declared_mime,
                record.captured_at,
                record.ref_count as i64,
                record.first_stored_at.to_rfc3339(),
                record.last_seen_at.to_rfc3339(),
                serde_json::to_string(&record.warnings)?,
                serde_json::to_string(&record.metadata)?,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Drop a pending reservation that will not be committed
    pub fn release_reservation(&self, digest: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM dedup_index WHERE digest = ?1 AND state = 'pending'",
            params![digest],
        )?;
        Ok(removed > 0)
    }

    /// Bump the reference count on a dedup hit and return the record
    pub fn touch_object(&self, object_id: Ulid) -> Result<ObjectRecord> {
        let conn = self.conn.lock();

        let updated = conn.execute(
            "UPDATE objects SET ref_count = ref_count + 1, last_seen_at = ?2
             WHERE object_id = ?1",
            params![object_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(Error::invariant(format!(
                "dedup index points at missing object {}",
                object_id
            )));
        }

        let record = conn.query_row(
            "SELECT * FROM objects WHERE object_id = ?1",
            params![object_id.to_string()],
            row_to_object_record,
        )?;
        Ok(record)
    }

    // ==================== Object Lookups ====================

    /// Get an object record by id
    pub fn get_object(&self, object_id: Ulid) -> Result<Option<ObjectRecord>> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                "SELECT * FROM objects WHERE object_id = ?1",
                params![object_id.to_string()],
                row_to_object_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Get an object record by content digest
    pub fn get_object_by_digest(&self, digest: &str) -> Result<Option<ObjectRecord>> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                "SELECT * FROM objects WHERE digest = ?1",
                params![digest],
                row_to_object_record,
            )
            .optional()?;
        Ok(record)
    }

    /// List committed objects, newest first
    pub fn list_objects(&self, limit: usize) -> Result<Vec<ObjectRecord>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT * FROM objects ORDER BY first_stored_at DESC LIMIT ?1")?;
        let records = stmt
            .query_map(params![limit as i64], row_to_object_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Get catalog statistics
    pub fn stats(&self) -> Result<CatalogStats> {
        let conn = self.conn.lock();

        let total_objects: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))
            .unwrap_or(0);
        let total_blob_bytes: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(blob_size), 0) FROM objects",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dedup_index WHERE state = 'pending'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(CatalogStats {
            total_objects: total_objects as usize,
            total_blob_bytes: total_blob_bytes as u64,
            pending_reservations: pending as usize,
        })
    }

    // ==================== Sweep Support ====================

    /// Pending reservations last touched before the cutoff
    pub fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<StaleReservation>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT digest, object_id FROM dedup_index
             WHERE state = 'pending' AND reserved_at < ?1",
        )?;
        let rows = stmt
            .query_map(params![older_than.to_rfc3339()], |row| {
                let digest: String = row.get(0)?;
                let object_id_str: String = row.get(1)?;
                Ok((digest, object_id_str))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(digest, object_id_str)| {
                Ulid::from_string(&object_id_str)
                    .ok()
                    .map(|object_id| StaleReservation { digest, object_id })
            })
            .collect();
        Ok(rows)
    }

    /// Remove a pending reservation only if it is still stale
    ///
    /// The age re-check guards against a live ingestion that took the
    /// reservation over after the sweep listed it.
    pub fn clear_stale_reservation(
        &self,
        digest: &str,
        older_than: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM dedup_index
             WHERE digest = ?1 AND state = 'pending' AND reserved_at < ?2",
            params![digest, older_than.to_rfc3339()],
        )?;
        Ok(removed > 0)
    }

    /// Every object id the catalog knows about, pending or committed
    ///
    /// Blob directories outside this set are orphans.
    pub fn known_object_ids(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("SELECT object_id FROM dedup_index")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // ==================== Ingestion Journal ====================

    /// Insert or update the journal row for an ingestion attempt
    pub fn journal_ingestion(&self, progress: &IngestionProgress) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO ingestions (
                id, filename, status, stage, digest, object_id,
                warnings, error, received_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                digest = excluded.digest,
                object_id = excluded.object_id,
                warnings = excluded.warnings,
                error = excluded.error,
                completed_at = excluded.completed_at
            "#,
            params![
                progress.id.to_string(),
                progress.filename,
                progress.status.to_string(),
                progress.stage.to_string(),
                progress.content_address.as_ref().map(|a| a.digest.clone()),
                progress.content_address.as_ref().map(|a| a.id.to_string()),
                serde_json::to_string(&progress.warnings)?,
                progress.error,
                progress.received_at.to_rfc3339(),
                progress.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        Ok(())
    }

    /// Get a journaled ingestion by id
    pub fn get_ingestion(&self, id: Uuid) -> Result<Option<IngestionRecord>> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                "SELECT * FROM ingestions WHERE id = ?1",
                params![id.to_string()],
                row_to_ingestion_record,
            )
            .optional()?;
        Ok(record)
    }

    /// List recent ingestion attempts, newest first
    pub fn recent_ingestions(&self, limit: usize) -> Result<Vec<IngestionRecord>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT * FROM ingestions ORDER BY received_at DESC LIMIT ?1")?;
        let records = stmt
            .query_map(params![limit as i64], row_to_ingestion_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }
}

// Helper functions

fn status_from_str(s: &str) -> IngestionStatus {
    match s {
        "queued" => IngestionStatus::Queued,
        "running" => IngestionStatus::Running,
        "completed" => IngestionStatus::Completed,
        "completed_with_warnings" => IngestionStatus::CompletedWithWarnings,
        "rejected" => IngestionStatus::Rejected,
        _ => IngestionStatus::Failed,
    }
}

fn stage_from_str(s: &str) -> IngestionStage {
    match s {
        "detecting" => IngestionStage::Detecting,
        "extracting" => IngestionStage::Extracting,
        "normalizing" => IngestionStage::Normalizing,
        "addressing" => IngestionStage::Addressing,
        "storing" => IngestionStage::Storing,
        "done" => IngestionStage::Done,
        _ => IngestionStage::Received,
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_object_record(row: &rusqlite::Row) -> rusqlite::Result<ObjectRecord> {
    let object_id_str: String = row.get(0)?;
    let digest: String = row.get(1)?;
    let original_format: String = row.get(2)?;
    let page_count: i64 = row.get(3)?;
    let blob_size: i64 = row.get(4)?;
    let source_filename: Option<String> = row.get(5)?;
    let declared_mime: Option<String> = row.get(6)?;
    let captured_at: Option<String> = row.get(7)?;
    let ref_count: i64 = row.get(8)?;
    let first_stored_at_str: String = row.get(9)?;
    let last_seen_at_str: String = row.get(10)?;
    let warnings_json: Option<String> = row.get(11)?;
    let metadata_json: Option<String> = row.get(12)?;

    Ok(ObjectRecord {
        object_id: Ulid::from_string(&object_id_str).unwrap_or_default(),
        digest,
        original_format,
        page_count: page_count as u32,
        blob_size: blob_size as u64,
        source_filename,
        declared_mime,
        captured_at,
        ref_count: ref_count as u32,
        first_stored_at: parse_rfc3339(&first_stored_at_str),
        last_seen_at: parse_rfc3339(&last_seen_at_str),
        warnings: warnings_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        metadata: metadata_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
    })
}

fn row_to_ingestion_record(row: &rusqlite::Row) -> rusqlite::Result<IngestionRecord> {
    let id_str: String = row.get(0)?;
    let filename: Option<String> = row.get(1)?;
    let status_str: String = row.get(2)?;
    let stage_str: String = row.get(3)?;
    let digest: Option<String> = row.get(4)?;
    let object_id_str: Option<String> = row.get(5)?;
    let warnings_json: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let received_at_str: String = row.get(8)?;
    let completed_at_str: Option<String> = row.get(9)?;

    Ok(IngestionRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        filename,
        status: status_from_str(&status_str),
        stage: stage_from_str(&stage_str),
        digest,
        object_id: object_id_str.and_then(|s| Ulid::from_string(&s).ok()),
        warnings: warnings_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        error,
        received_at: parse_rfc3339(&received_at_str),
        completed_at: completed_at_str.as_deref().map(parse_rfc3339),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_record(digest: &str, object_id: Ulid) -> ObjectRecord {
        let now = Utc::now();
        ObjectRecord {
            object_id,
            digest: digest.to_string(),
            original_format: "pdf".to_string(),
            page_count: 3,
            blob_size: 2048,
            source_filename: Some("report.pdf".to_string()),
            declared_mime: Some("application/pdf".to_string()),
            captured_at: None,
            ref_count: 1,
            first_stored_at: now,
            last_seen_at: now,
            warnings: vec!["page 2 unreadable".to_string()],
            metadata: BTreeMap::from([("title".to_string(), "Report".to_string())]),
        }
    }

    #[test]
    fn test_reserve_commit_then_hit() {
        let db = CatalogDb::in_memory().unwrap();
        let candidate = Ulid::new();

        let first = db.reserve_digest("d1", candidate).unwrap();
        assert_eq!(first, DigestReservation::Reserved { object_id: candidate });

        db.commit_object(&sample_record("d1", candidate)).unwrap();

        let second = db.reserve_digest("d1", Ulid::new()).unwrap();
        assert_eq!(second, DigestReservation::Committed { object_id: candidate });

        let touched = db.touch_object(candidate).unwrap();
        assert_eq!(touched.ref_count, 2);
        assert_eq!(touched.digest, "d1");
    }

    #[test]
    fn test_pending_takeover_reuses_object_id() {
        let db = CatalogDb::in_memory().unwrap();
        let original = Ulid::new();

        db.reserve_digest("d1", original).unwrap();

        // A second reservation before commit means the first owner died;
        // the existing object id wins over the new candidate.
        let takeover = db.reserve_digest("d1", Ulid::new()).unwrap();
        assert_eq!(takeover, DigestReservation::Reserved { object_id: original });
    }

    #[test]
    fn test_commit_without_reservation_is_rejected() {
        let db = CatalogDb::in_memory().unwrap();

        let err = db.commit_object(&sample_record("d1", Ulid::new())).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(db.get_object_by_digest("d1").unwrap().is_none());
    }

    #[test]
    fn test_release_reservation() {
        let db = CatalogDb::in_memory().unwrap();

        db.reserve_digest("d1", Ulid::new()).unwrap();
        assert!(db.release_reservation("d1").unwrap());
        assert!(!db.release_reservation("d1").unwrap());

        let fresh = Ulid::new();
        let again = db.reserve_digest("d1", fresh).unwrap();
        assert_eq!(again, DigestReservation::Reserved { object_id: fresh });
    }

    #[test]
    fn test_stale_reservation_lifecycle() {
        let db = CatalogDb::in_memory().unwrap();
        let object_id = Ulid::new();
        db.reserve_digest("d1", object_id).unwrap();

        let past = Utc::now() - Duration::seconds(60);
        assert!(db.stale_reservations(past).unwrap().is_empty());
        assert!(!db.clear_stale_reservation("d1", past).unwrap());

        let future = Utc::now() + Duration::seconds(60);
        let stale = db.stale_reservations(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].object_id, object_id);
        assert!(db.clear_stale_reservation("d1", future).unwrap());
        assert!(db.stale_reservations(future).unwrap().is_empty());
    }

    #[test]
    fn test_known_object_ids_covers_both_states() {
        let db = CatalogDb::in_memory().unwrap();
        let committed = Ulid::new();
        let pending = Ulid::new();

        db.reserve_digest("d1", committed).unwrap();
        db.commit_object(&sample_record("d1", committed)).unwrap();
        db.reserve_digest("d2", pending).unwrap();

        let known = db.known_object_ids().unwrap();
        assert!(known.contains(&committed.to_string()));
        assert!(known.contains(&pending.to_string()));
    }

    #[test]
    fn test_object_record_roundtrip() {
        let db = CatalogDb::in_memory().unwrap();
        let object_id = Ulid::new();

        db.reserve_digest("d1", object_id).unwrap();
        db.commit_object(&sample_record("d1", object_id)).unwrap();

        let record = db.get_object(object_id).unwrap().unwrap();
        assert_eq!(record.page_count, 3);
        assert_eq!(record.warnings, vec!["page 2 unreadable".to_string()]);
        assert_eq!(record.metadata.get("title").map(String::as_str), Some("Report"));

        let listed = db.list_objects(10).unwrap();
        assert_eq!(listed.len(), 1);

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_objects, 1);
        assert_eq!(stats.total_blob_bytes, 2048);
        assert_eq!(stats.pending_reservations, 0);
    }

    #[test]
    fn test_ingestion_journal_upsert() {
        let db = CatalogDb::in_memory().unwrap();

        let mut progress = IngestionProgress::new(Uuid::new_v4(), Some("a.jpg".to_string()));
        db.journal_ingestion(&progress).unwrap();

        progress.status = IngestionStatus::CompletedWithWarnings;
        progress.stage = IngestionStage::Done;
        progress.warnings.push("exif unreadable".to_string());
        progress.completed_at = Some(Utc::now());
        db.journal_ingestion(&progress).unwrap();

        let record = db.get_ingestion(progress.id).unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::CompletedWithWarnings);
        assert_eq!(record.stage, IngestionStage::Done);
        assert_eq!(record.warnings, vec!["exif unreadable".to_string()]);
        assert!(record.completed_at.is_some());

        assert_eq!(db.recent_ingestions(5).unwrap().len(), 1);
    }
}

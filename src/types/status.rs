//! Ingestion lifecycle states and progress reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ContentAddress;

/// Pipeline stage an ingestion is currently in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStage {
    Received,
    Detecting,
    Extracting,
    Normalizing,
    Addressing,
    Storing,
    Done,
}

impl std::fmt::Display for IngestionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestionStage::Received => "received",
            IngestionStage::Detecting => "detecting",
            IngestionStage::Extracting => "extracting",
            IngestionStage::Normalizing => "normalizing",
            IngestionStage::Addressing => "addressing",
            IngestionStage::Storing => "storing",
            IngestionStage::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Terminal and in-flight states of one ingestion attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Queued,
    Running,
    Completed,
    CompletedWithWarnings,
    Rejected,
    Failed,
}

impl IngestionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestionStatus::Completed
                | IngestionStatus::CompletedWithWarnings
                | IngestionStatus::Rejected
                | IngestionStatus::Failed
        )
    }

    /// Terminal states in which the content was durably stored
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            IngestionStatus::Completed | IngestionStatus::CompletedWithWarnings
        )
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestionStatus::Queued => "queued",
            IngestionStatus::Running => "running",
            IngestionStatus::Completed => "completed",
            IngestionStatus::CompletedWithWarnings => "completed_with_warnings",
            IngestionStatus::Rejected => "rejected",
            IngestionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Live progress record for one ingestion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionProgress {
    pub id: Uuid,
    pub status: IngestionStatus,
    pub stage: IngestionStage,
    pub filename: Option<String>,
    /// Set once addressing has assigned (or reused) an address
    pub content_address: Option<ContentAddress>,
    /// Non-fatal problems accumulated along the way
    pub warnings: Vec<String>,
    /// Terminal error message for rejected and failed attempts
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when a caller asked for this attempt to stop
    pub cancel_requested: bool,
}

impl IngestionProgress {
    pub fn new(id: Uuid, filename: Option<String>) -> Self {
        Self {
            id,
            status: IngestionStatus::Queued,
            stage: IngestionStage::Received,
            filename,
            content_address: None,
            warnings: Vec::new(),
            error: None,
            received_at: Utc::now(),
            completed_at: None,
            cancel_requested: false,
        }
    }
}

/// Terminal notification delivered exactly once per ingestion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub ingestion_id: Uuid,
    pub status: IngestionStatus,
    pub content_address: Option<ContentAddress>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

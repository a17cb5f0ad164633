//! Configuration for the ingestion service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoriesConfig {
    /// Storage layout and durability settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Pipeline concurrency and timeouts
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Staging directory watcher
    #[serde(default)]
    pub staging: StagingConfig,
    /// Extraction behavior
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl MemoriesConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, or fall back to defaults when absent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.blob_chunk_bytes == 0 {
            return Err(Error::Config("storage.blob_chunk_bytes must be > 0".into()));
        }
        if self.storage.retry_max_attempts == 0 {
            return Err(Error::Config(
                "storage.retry_max_attempts must be >= 1".into(),
            ));
        }
        if self.storage.retry_base_delay_ms > self.storage.retry_max_delay_ms {
            return Err(Error::Config(
                "storage.retry_base_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }
        if self.pipeline.queue_size == 0 {
            return Err(Error::Config("pipeline.queue_size must be > 0".into()));
        }
        if self.pipeline.workers == Some(0) {
            return Err(Error::Config("pipeline.workers must be > 0".into()));
        }
        if self.pipeline.page_decode_permits == Some(0) {
            return Err(Error::Config(
                "pipeline.page_decode_permits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for blobs and the catalog database
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Chunk size for blob uploads in bytes (default: 4MB)
    #[serde(default = "default_blob_chunk_bytes")]
    pub blob_chunk_bytes: usize,
    /// Attempts per blob write before giving up (default: 5)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// First retry delay in milliseconds (default: 100)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds (default: 5000)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Seconds between orphan sweeps (default: 3600)
    #[serde(default = "default_orphan_sweep_interval_secs")]
    pub orphan_sweep_interval_secs: u64,
    /// Minimum age before an uncommitted blob or reservation is reclaimed
    /// (default: 3600)
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

fn default_root_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memories")
}

fn default_blob_chunk_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_orphan_sweep_interval_secs() -> u64 {
    3600
}

fn default_orphan_grace_secs() -> u64 {
    3600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            blob_chunk_bytes: default_blob_chunk_bytes(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            orphan_sweep_interval_secs: default_orphan_sweep_interval_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl StorageConfig {
    pub fn blob_dir(&self) -> PathBuf {
        self.root_dir.join("blobs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root_dir.join("tmp")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root_dir.join("catalog.db")
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of parallel ingestion workers (default: CPU count, max 8)
    pub workers: Option<usize>,
    /// Bounded intake queue depth (default: 1000)
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Timeout for format detection in seconds (default: 5)
    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,
    /// Timeout for extraction and normalization in seconds (default: 300)
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    /// Timeout for the storage stage in seconds (default: 120)
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Concurrent page decodes across all workers (default: worker count)
    pub page_decode_permits: Option<usize>,
}

fn default_queue_size() -> usize {
    1000
}

fn default_detect_timeout_secs() -> u64 {
    5
}

fn default_extract_timeout_secs() -> u64 {
    300
}

fn default_store_timeout_secs() -> u64 {
    120
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_size: default_queue_size(),
            detect_timeout_secs: default_detect_timeout_secs(),
            extract_timeout_secs: default_extract_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            page_decode_permits: None,
        }
    }
}

impl PipelineConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().clamp(1, 8))
    }

    pub fn effective_page_decode_permits(&self) -> usize {
        self.page_decode_permits
            .unwrap_or_else(|| self.effective_workers())
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

/// Staging directory watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory to watch for dropped files; disabled when unset
    pub dir: Option<PathBuf>,
    /// Seconds between directory scans (default: 5)
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// A file must be unchanged this long before it is picked up
    /// (default: 2)
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_settle_secs() -> u64 {
    2
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            scan_interval_secs: default_scan_interval_secs(),
            settle_secs: default_settle_secs(),
        }
    }
}

impl StagingConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

/// Extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum accepted input size in bytes (default: 100MB)
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,
    /// Generate thumbnail sidecars for image content (default: true)
    #[serde(default = "default_generate_thumbnails")]
    pub generate_thumbnails: bool,
}

fn default_max_input_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_generate_thumbnails() -> bool {
    true
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: default_max_input_bytes(),
            generate_thumbnails: default_generate_thumbnails(),
        }
    }
}

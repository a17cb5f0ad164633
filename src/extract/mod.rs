//! Per-format content extraction
//!
//! One adapter per supported format, dispatched by match on the detected
//! format. Adapters parse the full source bytes, multi-page formats one
//! page at a time. A result can be partial: recoverable pages are kept,
//! failures become warnings, and the partial flag routes the ingestion to
//! a stored-with-warnings outcome instead of a failure.

pub mod docx;
pub mod epub;
pub mod image;
pub mod pdf;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::types::{DetectedFormat, SourceFile};

/// A page image as produced by an adapter
#[derive(Debug, Clone)]
pub enum ExtractedImage {
    /// Decoded pixels with orientation already applied
    Raster(::image::DynamicImage),
    /// Payload kept in its source encoding because no decoder is available
    Passthrough {
        encoding: String,
        width: u32,
        height: u32,
        bytes: Vec<u8>,
    },
}

/// One extracted page, before normalization
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub text: Option<String>,
    pub image: Option<ExtractedImage>,
}

/// Ordered pages plus source-flavored metadata from one adapter run
///
/// Metadata keys keep their source field names ("Title", "dc:creator",
/// "DateTimeOriginal"); normalization owns the mapping onto the canonical
/// vocabulary. Date values are already rendered as RFC 3339 since only the
/// adapter knows the source date format.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub pages: Vec<ExtractedPage>,
    pub metadata: BTreeMap<String, String>,
    pub partial: bool,
    pub warnings: Vec<String>,
}

impl ExtractionResult {
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
        self.partial = true;
    }
}

/// The closed set of extraction adapters
///
/// Built once at startup. Heavy decoding runs on blocking threads gated by
/// a process-wide semaphore so concurrent ingestions cannot multiply peak
/// decode memory without bound.
pub struct ExtractorSet {
    decode_permits: Arc<Semaphore>,
}

impl ExtractorSet {
    pub fn new(decode_permits: usize) -> Self {
        Self {
            decode_permits: Arc::new(Semaphore::new(decode_permits)),
        }
    }

    /// Run the adapter selected by `format` over the source bytes
    pub async fn extract(
        &self,
        format: DetectedFormat,
        source: &SourceFile,
    ) -> Result<ExtractionResult> {
        let bytes = source.bytes.clone();
        match format {
            DetectedFormat::Image(kind) => {
                image::extract(bytes, kind, self.decode_permits.clone()).await
            }
            DetectedFormat::Pdf => pdf::extract(bytes, self.decode_permits.clone()).await,
            DetectedFormat::Epub => epub::extract(bytes, self.decode_permits.clone()).await,
            DetectedFormat::Docx => docx::extract(bytes, self.decode_permits.clone()).await,
            DetectedFormat::Unknown => Err(Error::UnsupportedFormat {
                hint: source
                    .filename
                    .clone()
                    .or_else(|| source.declared_mime.clone()),
            }),
        }
    }
}

/// Run a CPU-bound parse on a blocking thread under the decode semaphore
pub(crate) async fn run_decode<T, F>(permits: Arc<Semaphore>, parse: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let permit = permits
        .acquire_owned()
        .await
        .map_err(|_| Error::internal("decode semaphore closed"))?;
    let handle = tokio::task::spawn_blocking(move || {
        let result = parse();
        drop(permit);
        result
    });
    handle
        .await
        .map_err(|e| Error::internal(format!("extraction task panicked: {e}")))?
}

/// Shared helper for the ZIP-based formats
pub(crate) fn open_zip(bytes: &Bytes) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes.as_ref()))
        .map_err(|e| Error::corrupt("zip", format!("cannot open archive: {e}")))
}

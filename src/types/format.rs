//! Detected file formats

use serde::{Deserialize, Serialize};

/// Image codec variants the pipeline accepts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// JPEG photograph
    Jpeg,
    /// PNG image
    Png,
    /// WebP image
    WebP,
    /// HEIC/HEIF container (iPhone photos)
    Heic,
}

/// Format classification derived from content signatures
///
/// Derived per ingestion and never stored long-term; the canonical metadata
/// records the label string instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DetectedFormat {
    /// Raster image
    Image(ImageKind),
    /// PDF document
    Pdf,
    /// EPUB ebook
    Epub,
    /// Microsoft Word document (.docx)
    Docx,
    /// No supported signature matched
    Unknown,
}

impl ImageKind {
    /// Short lowercase label used in metadata and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Heic => "heic",
        }
    }
}

impl DetectedFormat {
    /// Short lowercase label used in metadata and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Image(kind) => kind.label(),
            Self::Pdf => "pdf",
            Self::Epub => "epub",
            Self::Docx => "docx",
            Self::Unknown => "unknown",
        }
    }

    /// Whether an extraction adapter exists for this format
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Image(ImageKind::Jpeg) => "JPEG Image",
            Self::Image(ImageKind::Png) => "PNG Image",
            Self::Image(ImageKind::WebP) => "WebP Image",
            Self::Image(ImageKind::Heic) => "HEIC Image",
            Self::Pdf => "PDF",
            Self::Epub => "EPUB eBook",
            Self::Docx => "Word Document (.docx)",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for DetectedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

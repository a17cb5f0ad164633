//! Canonical document model produced by normalization

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical metadata vocabulary
///
/// Normalization maps every format-specific field name onto one of these
/// keys; anything unrecognized is preserved under the [`meta_keys::EXTRA`]
/// prefix instead of being dropped.
pub mod meta_keys {
    /// Original format label ("jpeg", "pdf", ...)
    pub const ORIGINAL_FORMAT: &str = "original_format";
    /// Capture timestamp (RFC 3339) from camera metadata
    pub const CAPTURED_AT: &str = "captured_at";
    /// Document creation timestamp (RFC 3339)
    pub const CREATED_AT: &str = "created_at";
    /// Document title
    pub const TITLE: &str = "title";
    /// Author or creator
    pub const AUTHOR: &str = "author";
    /// Publisher
    pub const PUBLISHER: &str = "publisher";
    /// Content language tag
    pub const LANGUAGE: &str = "language";
    /// Camera manufacturer
    pub const CAMERA_MAKE: &str = "camera_make";
    /// Camera model
    pub const CAMERA_MODEL: &str = "camera_model";
    /// GPS latitude in signed decimal degrees
    pub const GPS_LATITUDE: &str = "gps_latitude";
    /// GPS longitude in signed decimal degrees
    pub const GPS_LONGITUDE: &str = "gps_longitude";
    /// Namespace prefix for preserved unrecognized fields
    pub const EXTRA: &str = "extra.";
}

/// A single page image in its canonical (or passthrough) encoding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageImage {
    /// Encoding tag: "png" for canonically re-encoded rasters, the source
    /// codec label for passthrough payloads
    pub encoding: String,
    /// Display width in pixels after orientation is applied
    pub width: u32,
    /// Display height in pixels after orientation is applied
    pub height: u32,
    /// Encoded image bytes
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// One page of a normalized document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    /// Zero-based index; contiguous and in source order
    pub index: u32,
    /// Text layer, if the source page carried any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Raster layer, if the source page carried any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PageImage>,
}

/// The canonical document entity
///
/// Contains only content-derived data. Ingestion-time values (receipt
/// timestamps, filenames, paths) live in the catalog record instead, so
/// byte-identical content always serializes to byte-identical JSON and the
/// same digest. Field order and the sorted metadata map are part of the
/// canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedDocument {
    /// Label of the detected source format
    pub original_format: String,
    /// Pages in source order, indexed from zero
    pub pages: Vec<Page>,
    /// Canonical metadata; keys unique and sorted
    pub metadata: BTreeMap<String, String>,
}

impl NormalizedDocument {
    /// Number of pages
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// First page carrying a raster layer, if any
    pub fn first_image(&self) -> Option<&PageImage> {
        self.pages.iter().find_map(|p| p.image.as_ref())
    }

    /// Serialize to the canonical byte form used for digesting and storage
    pub fn to_canonical_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Reconstruct a document from its canonical byte form
    pub fn from_canonical_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

//! Normalization into the canonical document model
//!
//! Deterministic by construction: the same extraction output always
//! produces byte-identical canonical documents, which is what makes the
//! content digest meaningful. Rasters re-encode to 8-bit PNG, text gets a
//! uniform cleanup, metadata keys map onto the canonical vocabulary with
//! unrecognized fields preserved under the `extra.` namespace, and pages
//! are indexed contiguously from zero in source order.

use std::collections::BTreeMap;

use image::DynamicImage;

use crate::error::{Error, Result};
use crate::extract::{ExtractedImage, ExtractionResult};
use crate::types::{meta_keys, DetectedFormat, NormalizedDocument, Page, PageImage};

pub fn normalize(
    format: DetectedFormat,
    extraction: &ExtractionResult,
) -> Result<NormalizedDocument> {
    if extraction.pages.is_empty() {
        return Err(Error::invariant("normalization requires at least one page"));
    }

    let mut pages = Vec::with_capacity(extraction.pages.len());
    for (index, extracted) in extraction.pages.iter().enumerate() {
        let text = extracted
            .text
            .as_deref()
            .map(clean_text)
            .filter(|t| !t.is_empty());
        let image = match &extracted.image {
            Some(ExtractedImage::Raster(img)) => Some(encode_canonical_png(img)?),
            Some(ExtractedImage::Passthrough {
                encoding,
                width,
                height,
                bytes,
            }) => Some(PageImage {
                encoding: encoding.clone(),
                width: *width,
                height: *height,
                bytes: bytes.clone(),
            }),
            None => None,
        };
        pages.push(Page {
            index: index as u32,
            text,
            image,
        });
    }

    let label = format.label().to_string();
    let mut metadata = canonical_metadata(&extraction.metadata);
    metadata.insert(meta_keys::ORIGINAL_FORMAT.to_string(), label.clone());

    Ok(NormalizedDocument {
        original_format: label,
        pages,
        metadata,
    })
}

/// Re-encode pixels as 8-bit PNG, keeping alpha only when the source has it
fn encode_canonical_png(img: &DynamicImage) -> Result<PageImage> {
    let (flattened, width, height) = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        (DynamicImage::ImageRgba8(rgba), w, h)
    } else {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        (DynamicImage::ImageRgb8(rgb), w, h)
    };

    let mut bytes = Vec::new();
    flattened
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| Error::internal(format!("png encode failed: {e}")))?;

    Ok(PageImage {
        encoding: "png".to_string(),
        width,
        height,
        bytes,
    })
}

/// Map source-flavored metadata keys onto the canonical vocabulary
fn canonical_metadata(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in source {
        match canonical_key(key) {
            Some(canonical) => {
                out.entry(canonical.to_string())
                    .or_insert_with(|| value.clone());
            }
            None => {
                out.insert(format!("{}{key}", meta_keys::EXTRA), value.clone());
            }
        }
    }
    out
}

fn canonical_key(source: &str) -> Option<&'static str> {
    Some(match source {
        "Title" | "dc:title" => meta_keys::TITLE,
        "Author" | "dc:creator" => meta_keys::AUTHOR,
        "CreationDate" | "dc:date" | "dcterms:created" => meta_keys::CREATED_AT,
        "dc:language" => meta_keys::LANGUAGE,
        "dc:publisher" => meta_keys::PUBLISHER,
        "DateTimeOriginal" => meta_keys::CAPTURED_AT,
        "Make" => meta_keys::CAMERA_MAKE,
        "Model" => meta_keys::CAMERA_MODEL,
        "GPSLatitude" => meta_keys::GPS_LATITUDE,
        "GPSLongitude" => meta_keys::GPS_LONGITUDE,
        _ => return None,
    })
}

/// Strip NULs, trim every line and drop blank runs
fn clean_text(text: &str) -> String {
    text.replace('\0', "")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

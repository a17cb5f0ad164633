//! Still-image extraction
//!
//! JPEG, PNG and WebP decode to pixels with the EXIF orientation applied,
//! so downstream consumers never see sideways images. HEIC has no pure
//! Rust pixel decoder, so its payload passes through in the source
//! encoding with dimensions read from the `ispe` property box; EXIF still
//! comes from the container. Capture timestamp, camera identity and GPS
//! position are preserved as metadata whenever the tags are present, and
//! the remaining recognized tags ride along under their tag names.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDateTime;
use exif::{Field, In, Tag, Value};
use image::{DynamicImage, ImageFormat};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::{run_decode, ExtractedImage, ExtractedPage, ExtractionResult};
use crate::types::ImageKind;

pub async fn extract(
    bytes: Bytes,
    kind: ImageKind,
    permits: Arc<Semaphore>,
) -> Result<ExtractionResult> {
    run_decode(permits, move || extract_sync(&bytes, kind)).await
}

fn extract_sync(bytes: &Bytes, kind: ImageKind) -> Result<ExtractionResult> {
    let mut result = ExtractionResult::default();
    let (metadata, orientation) = read_exif(bytes);
    result.metadata = metadata;

    let page_image = match kind {
        ImageKind::Heic => heic_passthrough(bytes, &mut result),
        _ => {
            let decoded = decode_raster(bytes, kind)?;
            let upright = apply_orientation(decoded, orientation.unwrap_or(1));
            ExtractedImage::Raster(upright)
        }
    };

    result.pages.push(ExtractedPage {
        text: None,
        image: Some(page_image),
    });
    debug!(format = kind.label(), "extracted image");
    Ok(result)
}

fn decode_raster(bytes: &[u8], kind: ImageKind) -> Result<DynamicImage> {
    let format = match kind {
        ImageKind::Jpeg => ImageFormat::Jpeg,
        ImageKind::Png => ImageFormat::Png,
        ImageKind::WebP => ImageFormat::WebP,
        ImageKind::Heic => {
            return Err(Error::internal("heic payloads are not pixel-decoded"));
        }
    };
    image::load_from_memory_with_format(bytes, format)
        .map_err(|e| Error::corrupt(kind.label(), format!("cannot decode image: {e}")))
}

/// Apply an EXIF orientation value (1..=8) so the pixels are upright
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn heic_passthrough(bytes: &Bytes, result: &mut ExtractionResult) -> ExtractedImage {
    let (width, height) = match heic_dimensions(bytes) {
        Some(dims) => dims,
        None => {
            result.warn("heic dimensions not found in property boxes");
            (0, 0)
        }
    };
    ExtractedImage::Passthrough {
        encoding: "heic".to_string(),
        width,
        height,
        bytes: bytes.to_vec(),
    }
}

/// Longest rendered value carried into metadata; MakerNote-style blobs stay out
const MAX_EXIF_VALUE_LEN: usize = 160;

fn read_exif(bytes: &[u8]) -> (BTreeMap<String, String>, Option<u32>) {
    let mut cursor = std::io::Cursor::new(bytes);
    match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => collect_exif(&exif),
        Err(_) => (BTreeMap::new(), None),
    }
}

/// Curated tags under their own keys, every other recognized tag under
/// `exif.<TagName>`, plus the orientation for pixel correction
fn collect_exif(exif: &exif::Exif) -> (BTreeMap<String, String>, Option<u32>) {
    let mut metadata = BTreeMap::new();

    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0));

    if let Some(raw) = ascii_field(exif.get_field(Tag::DateTimeOriginal, In::PRIMARY)) {
        if let Some(ts) = exif_datetime_to_rfc3339(&raw) {
            metadata.insert("DateTimeOriginal".to_string(), ts);
        }
    }
    if let Some(make) = ascii_field(exif.get_field(Tag::Make, In::PRIMARY)) {
        metadata.insert("Make".to_string(), make);
    }
    if let Some(model) = ascii_field(exif.get_field(Tag::Model, In::PRIMARY)) {
        metadata.insert("Model".to_string(), model);
    }

    if let Some(lat) = gps_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S') {
        metadata.insert("GPSLatitude".to_string(), format!("{lat:.6}"));
    }
    if let Some(lon) = gps_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W') {
        metadata.insert("GPSLongitude".to_string(), format!("{lon:.6}"));
    }

    for field in exif.fields() {
        if field.ifd_num != In::PRIMARY
            || curated_exif_tag(field.tag)
            || field.tag.description().is_none()
        {
            continue;
        }
        let rendered = field.display_value().to_string();
        if rendered.is_empty() || rendered.len() > MAX_EXIF_VALUE_LEN {
            continue;
        }
        metadata.insert(format!("exif.{}", field.tag), rendered);
    }

    (metadata, orientation)
}

/// Tags already folded into curated keys (or into the pixels, for
/// orientation), and never repeated under `exif.*`
fn curated_exif_tag(tag: Tag) -> bool {
    [
        Tag::Orientation,
        Tag::DateTimeOriginal,
        Tag::Make,
        Tag::Model,
        Tag::GPSLatitude,
        Tag::GPSLatitudeRef,
        Tag::GPSLongitude,
        Tag::GPSLongitudeRef,
        Tag::MakerNote,
    ]
    .contains(&tag)
}

fn ascii_field(field: Option<&Field>) -> Option<String> {
    match &field?.value {
        Value::Ascii(parts) => {
            let text = parts
                .first()
                .map(|b| String::from_utf8_lossy(b).trim_matches(['\0', ' ']).to_string())?;
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// `YYYY:MM:DD HH:MM:SS` to RFC 3339
fn exif_datetime_to_rfc3339(raw: &str) -> Option<String> {
    let parsed = NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S").ok()?;
    Some(format!("{}Z", parsed.format("%Y-%m-%dT%H:%M:%S")))
}

fn gps_coordinate(exif: &exif::Exif, tag: Tag, ref_tag: Tag, negative_ref: u8) -> Option<f64> {
    let dms = match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(parts) => parts.as_slice(),
        _ => return None,
    };
    let negative = match &exif.get_field(ref_tag, In::PRIMARY)?.value {
        Value::Ascii(parts) => parts
            .first()
            .and_then(|p| p.first())
            .map(|c| c.eq_ignore_ascii_case(&negative_ref))?,
        _ => return None,
    };
    dms_to_decimal(dms, negative)
}

fn dms_to_decimal(dms: &[exif::Rational], negative: bool) -> Option<f64> {
    let degrees = dms.first()?.to_f64();
    let minutes = dms.get(1).map(|r| r.to_f64()).unwrap_or(0.0);
    let seconds = dms.get(2).map(|r| r.to_f64()).unwrap_or(0.0);
    let mut decimal = degrees + minutes / 60.0 + seconds / 3600.0;
    if negative {
        decimal = -decimal;
    }
    Some(decimal)
}

/// Largest `ispe` (image spatial extents) entry under meta/iprp/ipco
fn heic_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let meta = find_box(bytes, b"meta")?;
    // meta is a full box, version and flags precede the children
    let iprp = find_box(meta.get(4..)?, b"iprp")?;
    let ipco = find_box(iprp, b"ipco")?;

    let mut best: Option<(u32, u32)> = None;
    let mut rest = ipco;
    while let Some((name, body, tail)) = next_box(rest) {
        if &name == b"ispe" && body.len() >= 12 {
            let w = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            let h = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
            let better = match best {
                Some((bw, bh)) => (w as u64 * h as u64) > (bw as u64 * bh as u64),
                None => true,
            };
            if better {
                best = Some((w, h));
            }
        }
        rest = tail;
    }
    best
}

fn find_box<'a>(data: &'a [u8], target: &[u8; 4]) -> Option<&'a [u8]> {
    let mut rest = data;
    while let Some((name, body, tail)) = next_box(rest) {
        if &name == target {
            return Some(body);
        }
        rest = tail;
    }
    None
}

/// Split the next ISO-BMFF box off the front of `data`
fn next_box(data: &[u8]) -> Option<([u8; 4], &[u8], &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let name = [data[4], data[5], data[6], data[7]];
    let (body_start, box_len) = match size32 {
        0 => (8, data.len()),
        1 => {
            if data.len() < 16 {
                return None;
            }
            let large = u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]);
            (16, usize::try_from(large).ok()?)
        }
        n => (8, n),
    };
    if box_len < body_start || box_len > data.len() {
        return None;
    }
    Some((name, &data[body_start..box_len], &data[box_len..]))
}

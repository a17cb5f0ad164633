//! PDF extraction via lopdf
//!
//! Text is pulled page-by-page so extracted-text memory peaks at the
//! largest single page, not the whole document. Pages that fail to decode
//! become warnings; the document only counts as corrupt when nothing at
//! all is recoverable.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
use lopdf::{Document, Object};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::{run_decode, ExtractedPage, ExtractionResult};

pub async fn extract(bytes: Bytes, permits: Arc<Semaphore>) -> Result<ExtractionResult> {
    run_decode(permits, move || extract_sync(&bytes)).await
}

fn extract_sync(bytes: &[u8]) -> Result<ExtractionResult> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| Error::corrupt("pdf", format!("cannot load document: {e}")))?;
    if doc.is_encrypted() {
        return Err(Error::corrupt("pdf", "encrypted document"));
    }

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(Error::corrupt("pdf", "document has no pages"));
    }

    let mut result = ExtractionResult::default();
    let mut recovered = 0usize;
    let mut any_text = false;

    for page_no in &page_numbers {
        // One page at a time keeps the decoded-text footprint bounded.
        match doc.extract_text(&[*page_no]) {
            Ok(raw) => {
                let text = cleanup_pdf_text(&raw);
                if !text.is_empty() {
                    any_text = true;
                }
                result.pages.push(ExtractedPage {
                    text: (!text.is_empty()).then_some(text),
                    image: None,
                });
                recovered += 1;
            }
            Err(e) => {
                result.warn(format!("pdf page {page_no} unreadable: {e}"));
            }
        }
    }

    if recovered == 0 {
        return Err(Error::corrupt("pdf", "no recoverable pages"));
    }
    if !any_text {
        result.warn("no extractable text, document may be image-based");
    }

    read_info_metadata(&doc, &mut result);
    debug!(
        pages = result.pages.len(),
        warnings = result.warnings.len(),
        "extracted pdf"
    );
    Ok(result)
}

/// Document metadata from the trailer Info dictionary
fn read_info_metadata(doc: &Document, result: &mut ExtractionResult) {
    let Ok(info_ref) = doc.trailer.get(b"Info") else {
        return;
    };
    let info = match info_ref {
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Dictionary(dict)) => dict,
            _ => return,
        },
        Object::Dictionary(dict) => dict,
        _ => return,
    };

    for key in ["Title", "Author", "Subject", "Keywords", "Creator", "Producer"] {
        if let Ok(obj) = info.get(key.as_bytes()) {
            if let Some(value) = decode_pdf_string(obj) {
                if !value.is_empty() {
                    result.metadata.insert(key.to_string(), value);
                }
            }
        }
    }
    for key in ["CreationDate", "ModDate"] {
        if let Ok(obj) = info.get(key.as_bytes()) {
            if let Some(raw) = decode_pdf_string(obj) {
                if let Some(rfc3339) = parse_pdf_date(&raw) {
                    result.metadata.insert(key.to_string(), rfc3339);
                }
            }
        }
    }
}

/// Decode a PDF text string, honoring the UTF-16BE BOM form
fn decode_pdf_string(obj: &Object) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units).trim().to_string())
    } else {
        // PDFDocEncoding is close enough to Latin-1 for the fields we keep.
        Some(bytes.iter().map(|&b| b as char).collect::<String>().trim().to_string())
    }
}

/// Parse a PDF `D:YYYYMMDDHHmmSS` date (with optional zone) to RFC 3339
fn parse_pdf_date(raw: &str) -> Option<String> {
    let s = raw.strip_prefix("D:").unwrap_or(raw);
    let digits: &str = s;

    let field = |range: std::ops::Range<usize>, default: u32| -> Option<u32> {
        match digits.get(range) {
            Some(part) if part.chars().all(|c| c.is_ascii_digit()) => part.parse().ok(),
            Some(_) => None,
            None => Some(default),
        }
    };

    let year: i32 = digits.get(0..4)?.parse().ok()?;
    let month = field(4..6, 1)?;
    let day = field(6..8, 1)?;
    let hour = field(8..10, 0)?;
    let minute = field(10..12, 0)?;
    let second = field(12..14, 0)?;

    let date = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;

    let rest = digits.get(14..).unwrap_or("");
    let timestamp = match rest.chars().next() {
        Some(sign @ ('+' | '-')) => {
            let zone_digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            let zh: i32 = zone_digits.get(0..2).and_then(|p| p.parse().ok()).unwrap_or(0);
            let zm: i32 = zone_digits.get(2..4).and_then(|p| p.parse().ok()).unwrap_or(0);
            let mut offset_secs = zh * 3600 + zm * 60;
            if sign == '-' {
                offset_secs = -offset_secs;
            }
            let zone = FixedOffset::east_opt(offset_secs)?;
            zone.from_local_datetime(&date).single()?.to_utc()
        }
        _ => Utc.from_utc_datetime(&date),
    };
    Some(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

/// Replace ligatures and typographic punctuation that PDF fonts emit
fn cleanup_pdf_text(text: &str) -> String {
    let replaced = text
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2026}', "...")
        .replace('\u{00A0}', " ")
        .replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl");

    replaced
        .replace('\0', "")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

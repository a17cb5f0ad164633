//! EPUB extraction via zip + quick-xml
//!
//! Follows the container chain: `META-INF/container.xml` names the OPF
//! package document, whose manifest and spine give the reading order.
//! Chapters are read from the archive one at a time and reduced to plain
//! text, so peak memory tracks the largest chapter. Dublin Core metadata
//! comes from the OPF metadata block.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::{open_zip, run_decode, ExtractedPage, ExtractionResult};

/// Dublin Core elements kept from the OPF metadata block
const DC_ELEMENTS: [&str; 5] = ["title", "creator", "language", "publisher", "date"];

pub async fn extract(bytes: Bytes, permits: Arc<Semaphore>) -> Result<ExtractionResult> {
    run_decode(permits, move || extract_sync(&bytes)).await
}

fn extract_sync(bytes: &Bytes) -> Result<ExtractionResult> {
    let mut archive = open_zip(bytes)?;

    let container = read_archive_text(&mut archive, "META-INF/container.xml")
        .ok_or_else(|| Error::corrupt("epub", "missing META-INF/container.xml"))?;
    let opf_path = container_rootfile(&container)
        .ok_or_else(|| Error::corrupt("epub", "container.xml names no rootfile"))?;
    let opf = read_archive_text(&mut archive, &opf_path)
        .ok_or_else(|| Error::corrupt("epub", format!("missing package document {opf_path}")))?;

    let opf_dir = match opf_path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    };
    let package = parse_opf(&opf, opf_dir);
    if package.spine.is_empty() {
        return Err(Error::corrupt("epub", "package document has an empty spine"));
    }

    let mut result = ExtractionResult {
        metadata: package.metadata,
        ..Default::default()
    };
    let mut recovered = 0usize;

    for href in &package.spine {
        match read_archive_text(&mut archive, href) {
            Some(xml) => {
                let text = xhtml_to_text(&xml);
                result.pages.push(ExtractedPage {
                    text: (!text.is_empty()).then_some(text),
                    image: None,
                });
                recovered += 1;
            }
            None => result.warn(format!("epub chapter {href} unreadable")),
        }
    }

    if recovered == 0 {
        return Err(Error::corrupt("epub", "no readable chapters"));
    }
    debug!(
        chapters = result.pages.len(),
        warnings = result.warnings.len(),
        "extracted epub"
    );
    Ok(result)
}

fn read_archive_text<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Option<String> {
    let mut file = archive.by_name(name).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    Some(content)
}

/// Pull the full-path attribute of the first rootfile element
fn container_rootfile(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"full-path" {
                            return Some(attr_value(&attr));
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

struct OpfPackage {
    metadata: BTreeMap<String, String>,
    /// Chapter paths in reading order, resolved against the archive root
    spine: Vec<String>,
}

fn parse_opf(xml: &str, opf_dir: &str) -> OpfPackage {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut metadata = BTreeMap::new();
    let mut manifest: BTreeMap<String, String> = BTreeMap::new();
    let mut spine_ids: Vec<String> = Vec::new();
    let mut current_dc: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"item" => record_manifest_item(&e, &mut manifest),
                    b"itemref" => record_spine_ref(&e, &mut spine_ids),
                    other => {
                        if let Ok(name) = std::str::from_utf8(other) {
                            if DC_ELEMENTS.contains(&name) {
                                current_dc = Some(format!("dc:{name}"));
                            }
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => record_manifest_item(&e, &mut manifest),
                b"itemref" => record_spine_ref(&e, &mut spine_ids),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if let Some(key) = current_dc.take() {
                    if let Ok(value) = e.unescape() {
                        let value = value.trim().to_string();
                        if !value.is_empty() {
                            metadata.entry(key).or_insert(value);
                        }
                    }
                }
            }
            Ok(Event::End(_)) => current_dc = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    let spine = spine_ids
        .iter()
        .filter_map(|id| manifest.get(id))
        .map(|href| resolve_href(opf_dir, href))
        .collect();

    OpfPackage { metadata, spine }
}

fn record_manifest_item(
    e: &quick_xml::events::BytesStart<'_>,
    manifest: &mut BTreeMap<String, String>,
) {
    let mut id = None;
    let mut href = None;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"id" => id = Some(attr_value(&attr)),
            b"href" => href = Some(attr_value(&attr)),
            _ => {}
        }
    }
    if let (Some(id), Some(href)) = (id, href) {
        manifest.insert(id, href);
    }
}

fn record_spine_ref(e: &quick_xml::events::BytesStart<'_>, spine_ids: &mut Vec<String>) {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"idref" {
            spine_ids.push(attr_value(&attr));
        }
    }
}

fn attr_value(attr: &quick_xml::events::attributes::Attribute<'_>) -> String {
    attr.unescape_value()
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned())
}

fn resolve_href(opf_dir: &str, href: &str) -> String {
    let href = href.trim_start_matches('/');
    if opf_dir.is_empty() {
        href.to_string()
    } else {
        format!("{opf_dir}/{href}")
    }
}

/// Reduce chapter XHTML to plain text, skipping script and style bodies
fn xhtml_to_text(xml: &str) -> String {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = String::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if matches!(e.local_name().as_ref(), b"script" | b"style") {
                    skip_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if matches!(name.as_ref(), b"script" | b"style") {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if is_block_element(name.as_ref()) {
                    out.push('\n');
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"br" {
                    out.push('\n');
                }
            }
            Ok(Event::Text(e)) => {
                if skip_depth == 0 {
                    if let Ok(text) = e.unescape() {
                        if !out.is_empty() && !out.ends_with(['\n', ' ']) {
                            out.push(' ');
                        }
                        out.push_str(text.trim());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_block_element(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div"
            | b"h1"
            | b"h2"
            | b"h3"
            | b"h4"
            | b"h5"
            | b"h6"
            | b"li"
            | b"tr"
            | b"blockquote"
    )
}

//! DOCX extraction via docx-rs
//!
//! Walks the document tree for paragraph and table text and reads core
//! properties straight from `docProps/core.xml` in the container. A DOCX
//! has no fixed pagination, so the whole body becomes one logical page.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use docx_rs::{DocumentChild, ParagraphChild, RunChild, TableCellContent, TableRowChild};
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extract::{open_zip, run_decode, ExtractedPage, ExtractionResult};

pub async fn extract(bytes: Bytes, permits: Arc<Semaphore>) -> Result<ExtractionResult> {
    run_decode(permits, move || extract_sync(&bytes)).await
}

fn extract_sync(bytes: &Bytes) -> Result<ExtractionResult> {
    let doc = docx_rs::read_docx(bytes)
        .map_err(|e| Error::corrupt("docx", format!("cannot parse document: {e}")))?;

    let mut text = String::new();
    for child in doc.document.children {
        match child {
            DocumentChild::Paragraph(p) => push_paragraph(&p.children, &mut text),
            DocumentChild::Table(t) => push_table(&t, &mut text),
            _ => {}
        }
    }
    let text = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let mut result = ExtractionResult {
        pages: vec![ExtractedPage {
            text: (!text.is_empty()).then_some(text),
            image: None,
        }],
        ..Default::default()
    };
    result.metadata = read_core_properties(bytes);
    debug!(warnings = result.warnings.len(), "extracted docx");
    Ok(result)
}

fn push_paragraph(children: &[ParagraphChild], out: &mut String) {
    for child in children {
        match child {
            ParagraphChild::Run(run) => {
                for rc in &run.children {
                    if let RunChild::Text(t) = rc {
                        out.push_str(&t.text);
                    }
                }
            }
            ParagraphChild::Hyperlink(link) => push_paragraph(&link.children, out),
            _ => {}
        }
    }
    out.push('\n');
}

fn push_table(table: &docx_rs::Table, out: &mut String) {
    for row in &table.rows {
        let docx_rs::TableChild::TableRow(row) = row;
        let mut cells: Vec<String> = Vec::new();
        for cell in &row.cells {
            let TableRowChild::TableCell(cell) = cell;
            let mut cell_text = String::new();
            for content in &cell.children {
                match content {
                    TableCellContent::Paragraph(p) => push_paragraph(&p.children, &mut cell_text),
                    TableCellContent::Table(t) => push_table(t, &mut cell_text),
                    _ => {}
                }
            }
            let cell_text = cell_text.trim().to_string();
            if !cell_text.is_empty() {
                cells.push(cell_text);
            }
        }
        if !cells.is_empty() {
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
    }
}

/// Core properties from `docProps/core.xml`
fn read_core_properties(bytes: &Bytes) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let Ok(mut archive) = open_zip(bytes) else {
        return metadata;
    };
    let Ok(mut file) = archive.by_name("docProps/core.xml") else {
        return metadata;
    };
    let mut xml = String::new();
    if file.read_to_string(&mut xml).is_err() {
        return metadata;
    }
    parse_core_xml(&xml, &mut metadata);
    metadata
}

fn parse_core_xml(xml: &str, metadata: &mut BTreeMap<String, String>) {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut current: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some("dc:title"),
                    b"creator" => Some("dc:creator"),
                    b"created" => Some("dcterms:created"),
                    b"modified" => Some("dcterms:modified"),
                    _ => None,
                };
            }
            Ok(Event::Text(e)) => {
                if let Some(key) = current.take() {
                    if let Ok(value) = e.unescape() {
                        let value = value.trim().to_string();
                        if !value.is_empty() {
                            metadata.insert(key.to_string(), value);
                        }
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
}

//! Format detection from magic-byte signatures
//!
//! Classification works on a bounded prefix of the input, never the full
//! file. Signatures are authoritative; the filename and declared MIME type
//! are consulted only to break ties between ZIP-container formats whose
//! distinguishing entries fall outside the prefix. A prefix matching no
//! signature classifies as [`DetectedFormat::Unknown`], which is a valid
//! outcome and not an error.

use crate::types::{DetectedFormat, ImageKind, SourceFile};

/// Number of leading bytes the detector inspects
pub const DETECT_PREFIX_LEN: usize = 512;

/// ISO-BMFF brands that identify HEIC/HEIF still images
const HEIC_BRANDS: [&[u8; 4]; 8] = [
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const EPUB_MIME: &str = "application/epub+zip";

/// Untrusted name and MIME hints accompanying a source file
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceHint<'a> {
    pub filename: Option<&'a str>,
    pub declared_mime: Option<&'a str>,
}

impl<'a> SourceHint<'a> {
    pub fn from_source(source: &'a SourceFile) -> Self {
        Self {
            filename: source.filename.as_deref(),
            declared_mime: source.declared_mime.as_deref(),
        }
    }
}

/// Classify a byte prefix into a [`DetectedFormat`]
pub fn detect(prefix: &[u8], hint: Option<&SourceHint<'_>>) -> DetectedFormat {
    if prefix.len() < 4 {
        return DetectedFormat::Unknown;
    }

    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return DetectedFormat::Image(ImageKind::Jpeg);
    }
    if prefix.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return DetectedFormat::Image(ImageKind::Png);
    }
    if prefix.len() >= 12 && &prefix[..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
        return DetectedFormat::Image(ImageKind::WebP);
    }
    if prefix.len() >= 12 && &prefix[4..8] == b"ftyp" {
        let brand = &prefix[8..12];
        if HEIC_BRANDS.iter().any(|b| &b[..] == brand) {
            return DetectedFormat::Image(ImageKind::Heic);
        }
        return DetectedFormat::Unknown;
    }
    // The ZIP magic is anchored at offset zero and must win before the
    // PDF scan below, or an archive with a stored PDF member early in it
    // reads as a PDF.
    if prefix.starts_with(&[b'P', b'K', 0x03, 0x04]) {
        return classify_zip(prefix, hint);
    }
    // Some producers prepend junk before the header, so scan rather than
    // anchor at offset zero.
    if find_subsequence(prefix, b"%PDF-").is_some() {
        return DetectedFormat::Pdf;
    }

    DetectedFormat::Unknown
}

/// Distinguish ZIP-container formats by walking local file headers
///
/// EPUB mandates a stored `mimetype` first entry whose body is the EPUB
/// MIME string; OOXML containers start with `[Content_Types].xml` and a
/// DOCX carries its parts under `word/`. When the walk runs off the end of
/// the prefix before either marker settles the question, the hints break
/// the tie; with no hint the container stays `Unknown`.
fn classify_zip(prefix: &[u8], hint: Option<&SourceHint<'_>>) -> DetectedFormat {
    let mut saw_content_types = false;
    let mut offset = 0usize;

    for _ in 0..8 {
        let Some(entry) = read_local_header(prefix, offset) else {
            break;
        };
        if entry.name == b"mimetype" {
            let body = &prefix[entry.data_start.min(prefix.len())..];
            if body.starts_with(EPUB_MIME.as_bytes()) {
                return DetectedFormat::Epub;
            }
        }
        if entry.name.starts_with(b"word/") {
            return DetectedFormat::Docx;
        }
        if entry.name == b"[Content_Types].xml" {
            saw_content_types = true;
        }
        let Some(next) = entry.next_offset else {
            break;
        };
        offset = next;
    }

    match hint {
        Some(h) => classify_zip_by_hint(h, saw_content_types),
        None => DetectedFormat::Unknown,
    }
}

fn classify_zip_by_hint(hint: &SourceHint<'_>, saw_content_types: bool) -> DetectedFormat {
    if hint.declared_mime == Some(DOCX_MIME) {
        return DetectedFormat::Docx;
    }
    if hint.declared_mime == Some(EPUB_MIME) && !saw_content_types {
        return DetectedFormat::Epub;
    }
    let ext = hint
        .filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("docx") => DetectedFormat::Docx,
        Some("epub") if !saw_content_types => DetectedFormat::Epub,
        _ => DetectedFormat::Unknown,
    }
}

struct LocalEntry<'a> {
    name: &'a [u8],
    data_start: usize,
    /// Offset of the next local header, when the sizes in this header
    /// allow computing it
    next_offset: Option<usize>,
}

fn read_local_header(prefix: &[u8], offset: usize) -> Option<LocalEntry<'_>> {
    let header = prefix.get(offset..offset + 30)?;
    if &header[..4] != [b'P', b'K', 0x03, 0x04] {
        return None;
    }
    let flags = u16::from_le_bytes([header[6], header[7]]);
    let comp_size = u32::from_le_bytes([header[18], header[19], header[20], header[21]]) as usize;
    let name_len = u16::from_le_bytes([header[26], header[27]]) as usize;
    let extra_len = u16::from_le_bytes([header[28], header[29]]) as usize;
    let name = prefix.get(offset + 30..offset + 30 + name_len)?;
    let data_start = offset + 30 + name_len + extra_len;
    // Bit 3 means sizes live in a trailing data descriptor, so the next
    // header cannot be located from this one.
    let streamed = flags & 0x0008 != 0;
    let next_offset = if streamed {
        None
    } else {
        Some(data_start + comp_size)
    };
    Some(LocalEntry {
        name,
        data_start,
        next_offset,
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_entry(name: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[b'P', b'K', 0x03, 0x04]);
        out.extend_from_slice(&[20, 0]); // version needed
        out.extend_from_slice(&[0, 0]); // flags
        out.extend_from_slice(&[0, 0]); // method: stored
        out.extend_from_slice(&[0, 0, 0, 0]); // time + date
        out.extend_from_slice(&[0, 0, 0, 0]); // crc
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0, 0]); // extra len
        out.extend_from_slice(name);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn detects_jpeg() {
        let prefix = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        assert_eq!(
            detect(&prefix, None),
            DetectedFormat::Image(ImageKind::Jpeg)
        );
    }

    #[test]
    fn detects_png() {
        let prefix = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect(&prefix, None), DetectedFormat::Image(ImageKind::Png));
    }

    #[test]
    fn detects_webp() {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(b"RIFF");
        prefix.extend_from_slice(&100u32.to_le_bytes());
        prefix.extend_from_slice(b"WEBP");
        assert_eq!(
            detect(&prefix, None),
            DetectedFormat::Image(ImageKind::WebP)
        );
    }

    #[test]
    fn detects_heic_brands() {
        for brand in [b"heic", b"mif1"] {
            let mut prefix = Vec::new();
            prefix.extend_from_slice(&24u32.to_be_bytes());
            prefix.extend_from_slice(b"ftyp");
            prefix.extend_from_slice(brand);
            prefix.extend_from_slice(&[0; 8]);
            assert_eq!(
                detect(&prefix, None),
                DetectedFormat::Image(ImageKind::Heic),
                "brand {:?}",
                String::from_utf8_lossy(brand)
            );
        }
    }

    #[test]
    fn unsupported_bmff_brand_is_unknown() {
        let mut prefix = Vec::new();
        prefix.extend_from_slice(&24u32.to_be_bytes());
        prefix.extend_from_slice(b"ftyp");
        prefix.extend_from_slice(b"avif");
        prefix.extend_from_slice(&[0; 8]);
        assert_eq!(detect(&prefix, None), DetectedFormat::Unknown);
    }

    #[test]
    fn detects_pdf_with_leading_junk() {
        let mut prefix = vec![0u8; 17];
        prefix.extend_from_slice(b"%PDF-1.7\n");
        assert_eq!(detect(&prefix, None), DetectedFormat::Pdf);
    }

    #[test]
    fn signature_beats_filename() {
        let hint = SourceHint {
            filename: Some("holiday.jpg"),
            declared_mime: Some("image/jpeg"),
        };
        assert_eq!(detect(b"%PDF-1.4\n%junk", Some(&hint)), DetectedFormat::Pdf);
    }

    #[test]
    fn detects_epub_from_mimetype_entry() {
        let prefix = zip_entry(b"mimetype", b"application/epub+zip");
        assert_eq!(detect(&prefix, None), DetectedFormat::Epub);
    }

    #[test]
    fn detects_docx_from_word_entry() {
        let mut prefix = zip_entry(b"[Content_Types].xml", b"<xml/>");
        prefix.extend_from_slice(&zip_entry(b"word/document.xml", b"<doc/>"));
        assert_eq!(detect(&prefix, None), DetectedFormat::Docx);
    }

    #[test]
    fn zip_magic_beats_embedded_pdf() {
        // A stored PDF member early in the archive puts %PDF- inside the
        // prefix; the container still wins.
        let mut prefix = zip_entry(b"word/embeddings/oleObject1.pdf", b"%PDF-1.7\nstream");
        prefix.extend_from_slice(&zip_entry(b"word/document.xml", b"<doc/>"));
        assert_eq!(detect(&prefix, None), DetectedFormat::Docx);

        let prefix = zip_entry(b"scans/receipt.pdf", b"%PDF-1.4\n");
        assert_eq!(detect(&prefix, None), DetectedFormat::Unknown);
    }

    #[test]
    fn ooxml_without_word_entry_uses_hint() {
        let big_body = vec![b'x'; DETECT_PREFIX_LEN];
        let prefix = zip_entry(b"[Content_Types].xml", &big_body);
        let prefix = &prefix[..DETECT_PREFIX_LEN];

        assert_eq!(detect(prefix, None), DetectedFormat::Unknown);

        let hint = SourceHint {
            filename: Some("report.docx"),
            declared_mime: None,
        };
        assert_eq!(detect(prefix, Some(&hint)), DetectedFormat::Docx);

        // An OOXML container is never an EPUB, whatever the name says.
        let hint = SourceHint {
            filename: Some("report.epub"),
            declared_mime: None,
        };
        assert_eq!(detect(prefix, Some(&hint)), DetectedFormat::Unknown);
    }

    #[test]
    fn plain_zip_is_unknown() {
        let prefix = zip_entry(b"notes.txt", b"hello");
        assert_eq!(detect(&prefix, None), DetectedFormat::Unknown);
    }

    #[test]
    fn short_prefix_is_unknown() {
        assert_eq!(detect(&[0xFF, 0xD8], None), DetectedFormat::Unknown);
        assert_eq!(detect(&[], None), DetectedFormat::Unknown);
    }

    #[test]
    fn random_bytes_are_unknown() {
        assert_eq!(detect(&[0x00, 0x01, 0x02, 0x03, 0x04], None), DetectedFormat::Unknown);
    }
}

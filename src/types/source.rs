//! Raw intake payloads

use bytes::Bytes;
use std::path::PathBuf;

/// Where an intake item came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Submitted programmatically by a caller
    Submitted,
    /// Picked up from the staging directory; the path is removed only after
    /// a terminal status is journaled
    Staging(PathBuf),
}

/// A raw byte stream handed to the pipeline
///
/// Owned by the pipeline invocation that received it and discarded after the
/// ingestion reaches a terminal status. The filename and declared MIME type
/// are untrusted hints; classification works from the bytes.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Raw content
    pub bytes: Bytes,
    /// Optional filename hint from the caller
    pub filename: Option<String>,
    /// Optional declared MIME type from the caller
    pub declared_mime: Option<String>,
    /// Intake origin
    pub origin: SourceOrigin,
}

impl SourceFile {
    /// Create a source file from caller-submitted bytes
    pub fn new(
        bytes: impl Into<Bytes>,
        filename: Option<String>,
        declared_mime: Option<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            filename,
            declared_mime,
            origin: SourceOrigin::Submitted,
        }
    }

    /// Create a source file read out of the staging directory. The declared
    /// MIME type is guessed from the extension; it stays a hint only.
    pub fn from_staging(path: PathBuf, bytes: impl Into<Bytes>) -> Self {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let declared_mime = mime_guess::from_path(&path).first_raw().map(str::to_string);
        Self {
            bytes: bytes.into(),
            filename,
            declared_mime,
            origin: SourceOrigin::Staging(path),
        }
    }

    /// Size of the raw payload in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Filename hint reduced to a storable form: control characters removed,
    /// anything outside `[A-Za-z0-9._-]` replaced, length capped
    pub fn sanitized_filename(&self) -> Option<String> {
        let raw = self.filename.as_deref()?;
        let mut cleaned: String = raw
            .chars()
            .filter(|c| !c.is_control())
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        while cleaned.contains("__") {
            cleaned = cleaned.replace("__", "_");
        }
        let cleaned = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
        if cleaned.is_empty() {
            return None;
        }
        Some(cleaned.chars().take(255).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_hostile_filenames() {
        let src = SourceFile::new(
            Bytes::from_static(b"x"),
            Some("../..//etc passwd\u{0007}.jpg".to_string()),
            None,
        );
        let name = src.sanitized_filename().unwrap();
        assert!(!name.contains('/'));
        assert!(!name.contains('\u{0007}'));
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn empty_after_cleaning_is_none() {
        let src = SourceFile::new(Bytes::from_static(b"x"), Some("///".to_string()), None);
        assert!(src.sanitized_filename().is_none());
    }

    #[test]
    fn staging_origin_keeps_path_and_name() {
        let src = SourceFile::from_staging(PathBuf::from("/staging/photo.jpg"), vec![1u8, 2, 3]);
        assert_eq!(src.filename.as_deref(), Some("photo.jpg"));
        assert_eq!(src.declared_mime.as_deref(), Some("image/jpeg"));
        assert_eq!(src.size(), 3);
        assert!(matches!(src.origin, SourceOrigin::Staging(_)));
    }
}

//! Plain-text extraction from uploaded curriculum documents.
//!
//! [`extract_text`] is synchronous and CPU-bound; the pipeline runs it on the blocking pool.
//! Every reader funnels its output through [`normalize`], so downstream stages only ever see
//! LF line endings, no control characters, and no leading or trailing whitespace.
mod doc;
mod docx;
mod pdf;

use std::fmt;
use thiserror::Error;

/// Formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    /// Portable Document Format.
    Pdf,
    /// Legacy Word binary document.
    Doc,
    /// Office Open XML word processing document.
    Docx,
    /// Plain UTF-8 text.
    Txt,
}

impl SourceFormat {
    /// Resolve a declared format: an extension (with or without the leading dot) or a mime
    /// type, compared case-insensitively.
    pub fn from_declared(declared: &str) -> Option<Self> {
        let essence = declared.split(';').next().unwrap_or_default().trim();
        let lowered = essence.to_ascii_lowercase();
        match lowered.trim_start_matches('.') {
            "pdf" | "application/pdf" => Some(Self::Pdf),
            "doc" | "application/msword" => Some(Self::Doc),
            "docx"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "txt" | "text" | "text/plain" => Some(Self::Txt),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pdf => "pdf",
            Self::Doc => "doc",
            Self::Docx => "docx",
            Self::Txt => "txt",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`extract_text`].
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Declared format is not one of PDF, DOC, DOCX or TXT.
    #[error("Unsupported document format: {0:?}")]
    UnsupportedFormat(String),
    /// Document is corrupt, encrypted, or yielded no text.
    #[error("Text extraction failed: {0}")]
    ExtractionFailed(String),
}

impl ExtractionError {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self::ExtractionFailed(message.into())
    }
}

/// Pick the declared format for an upload: the file extension when present, otherwise the
/// mime type. The value is stored verbatim and validated only by [`extract_text`].
pub fn declared_format(file_name: &str, mime_type: Option<&str>) -> String {
    let extension = std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::trim)
        .filter(|ext| !ext.is_empty());
    match (extension, mime_type.map(str::trim).filter(|m| !m.is_empty())) {
        (Some(ext), _) => ext.to_string(),
        (None, Some(mime)) => mime.to_string(),
        (None, None) => String::new(),
    }
}

/// Convert document bytes in `declared` format into normalized plain text.
pub fn extract_text(bytes: &[u8], declared: &str) -> Result<String, ExtractionError> {
    let format = SourceFormat::from_declared(declared)
        .ok_or_else(|| ExtractionError::UnsupportedFormat(declared.to_string()))?;
    if bytes.is_empty() {
        return Err(ExtractionError::failed("document is empty"));
    }

    let raw = match format {
        SourceFormat::Txt => decode_utf8(bytes)?,
        SourceFormat::Pdf => pdf::extract(bytes)?,
        SourceFormat::Docx => docx::extract(bytes)?,
        SourceFormat::Doc => doc::extract(bytes)?,
    };

    let text = normalize(&raw);
    if text.is_empty() {
        return Err(ExtractionError::failed(format!(
            "{format} document contains no extractable text"
        )));
    }
    tracing::debug!(%format, bytes = bytes.len(), chars = text.chars().count(), "Extracted text");
    Ok(text)
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ExtractionError> {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(body.to_vec())
        .map_err(|err| ExtractionError::failed(format!("text is not valid UTF-8: {err}")))
}

/// Unify line endings, drop control characters, collapse blank runs, and trim.
pub fn normalize(raw: &str) -> String {
    let unified = raw
        .replace("\r\n", "\n")
        .replace(['\r', '\u{000C}', '\u{000B}'], "\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0;
    for line in unified.split('\n') {
        let cleaned: String = line
            .chars()
            .filter(|c| *c == '\t' || !(c.is_control() || *c == '\u{FEFF}'))
            .collect();
        let cleaned = cleaned.trim_end();
        if cleaned.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(cleaned);
            out.push('\n');
        }
    }
    out.trim().to_string()
}

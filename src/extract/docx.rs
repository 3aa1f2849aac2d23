use super::ExtractionError;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::io::{Cursor, Read};

const DOCUMENT_PART: &str = "word/document.xml";
/// Inflated size allowed for the document part; bounds decompression bombs.
const MAX_DOCUMENT_XML_BYTES: u64 = 64 * 1024 * 1024;

/// Extract the body text of a DOCX package.
pub(super) fn extract(bytes: &[u8]) -> Result<String, ExtractionError> {
    extract_bounded(bytes, MAX_DOCUMENT_XML_BYTES)
}

fn extract_bounded(bytes: &[u8], limit: u64) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| ExtractionError::failed(format!("not a DOCX package: {err}")))?;
    let part = archive
        .by_name(DOCUMENT_PART)
        .map_err(|err| ExtractionError::failed(format!("missing {DOCUMENT_PART}: {err}")))?;
    let declared = part.size();
    let xml = read_bounded(part, declared, limit)?;
    body_text(&xml)
}

/// Read at most `limit` bytes of a part, trusting neither the declared size nor the stream.
fn read_bounded(part: impl Read, declared: u64, limit: u64) -> Result<String, ExtractionError> {
    let too_large = || {
        ExtractionError::failed(format!("{DOCUMENT_PART} inflates beyond {limit} bytes"))
    };
    if declared > limit {
        return Err(too_large());
    }
    let mut xml = String::new();
    part.take(limit + 1)
        .read_to_string(&mut xml)
        .map_err(|err| ExtractionError::failed(format!("unreadable {DOCUMENT_PART}: {err}")))?;
    if xml.len() as u64 > limit {
        return Err(too_large());
    }
    Ok(xml)
}

/// Walk WordprocessingML, keeping `w:t` runs and turning paragraphs and breaks into newlines.
fn body_text(xml: &str) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| ExtractionError::failed(format!("malformed document XML: {err}")))?;
        match event {
            Event::Start(tag) if tag.local_name().as_ref() == b"t" => in_text = true,
            Event::End(tag) => match tag.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                b"tc" => out.push('\t'),
                _ => {}
            },
            Event::Empty(tag) => match tag.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" | b"cr" | b"p" => out.push('\n'),
                _ => {}
            },
            Event::Text(text) if in_text => {
                let value = text.unescape().map_err(|err| {
                    ExtractionError::failed(format!("malformed document XML: {err}"))
                })?;
                out.push_str(&value);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

//! Legacy Word (`.doc`) text via the document's piece table.
//!
//! The `WordDocument` stream starts with a FIB that locates the CLX in the table stream. The
//! CLX's piece table maps character positions to byte ranges that are either 8-bit
//! (Windows-1252) or UTF-16LE. Only the main document story is read.

use super::ExtractionError;
use std::io::{Cursor, Read};

const WORD_IDENT: u16 = 0xA5EC;
const FLAGS_OFFSET: usize = 0x000A;
const FLAG_ENCRYPTED: u16 = 0x0100;
const FLAG_WHICH_TABLE: u16 = 0x0200;
const CCP_TEXT_OFFSET: usize = 0x004C;
const FC_CLX_OFFSET: usize = 0x01A2;
const LCB_CLX_OFFSET: usize = 0x01A6;
const FC_COMPRESSED: u32 = 0x4000_0000;

const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

struct Piece {
    cp_start: u32,
    cp_end: u32,
    offset: usize,
    compressed: bool,
}

pub(super) fn extract(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut file = cfb::CompoundFile::open(Cursor::new(bytes))
        .map_err(|err| ExtractionError::failed(format!("not a Word binary document: {err}")))?;
    let word = read_stream(&mut file, "/WordDocument")?;

    if read_u16(&word, 0)? != WORD_IDENT {
        return Err(ExtractionError::failed("WordDocument stream has an unknown signature"));
    }
    let flags = read_u16(&word, FLAGS_OFFSET)?;
    if flags & FLAG_ENCRYPTED != 0 {
        return Err(ExtractionError::failed("document is encrypted"));
    }
    let table_name = if flags & FLAG_WHICH_TABLE != 0 {
        "/1Table"
    } else {
        "/0Table"
    };
    let table = read_stream(&mut file, table_name)?;

    let main_story = read_u32(&word, CCP_TEXT_OFFSET)?;
    let fc_clx = read_u32(&word, FC_CLX_OFFSET)? as usize;
    let lcb_clx = read_u32(&word, LCB_CLX_OFFSET)? as usize;
    let clx = table
        .get(fc_clx..fc_clx.saturating_add(lcb_clx))
        .ok_or_else(|| ExtractionError::failed("piece table lies outside the table stream"))?;

    let mut text = String::new();
    for piece in pieces(clx)? {
        if piece.cp_start >= main_story {
            break;
        }
        let chars = (piece.cp_end.min(main_story) - piece.cp_start) as usize;
        decode_piece(&word, &piece, chars, &mut text)?;
    }
    Ok(strip_field_codes(&text))
}

fn read_stream(
    file: &mut cfb::CompoundFile<Cursor<&[u8]>>,
    path: &str,
) -> Result<Vec<u8>, ExtractionError> {
    let mut stream = file
        .open_stream(path)
        .map_err(|err| ExtractionError::failed(format!("missing {path} stream: {err}")))?;
    let mut buffer = Vec::new();
    stream
        .read_to_end(&mut buffer)
        .map_err(|err| ExtractionError::failed(format!("unreadable {path} stream: {err}")))?;
    Ok(buffer)
}

/// Parse the CLX: skip property modifiers, then read the piece table.
fn pieces(clx: &[u8]) -> Result<Vec<Piece>, ExtractionError> {
    let mut pos = 0;
    while clx.get(pos) == Some(&0x01) {
        let size = read_u16(clx, pos + 1)? as usize;
        pos += 3 + size;
    }
    if clx.get(pos) != Some(&0x02) {
        return Err(ExtractionError::failed("piece table marker not found"));
    }
    let length = read_u32(clx, pos + 1)? as usize;
    let plc = clx
        .get(pos + 5..pos + 5 + length)
        .ok_or_else(|| ExtractionError::failed("truncated piece table"))?;
    if length < 4 || (length - 4) % 12 != 0 {
        return Err(ExtractionError::failed("piece table has an invalid length"));
    }

    let count = (length - 4) / 12;
    let descriptors = 4 * (count + 1);
    let mut pieces = Vec::with_capacity(count);
    for index in 0..count {
        let cp_start = read_u32(plc, index * 4)?;
        let cp_end = read_u32(plc, (index + 1) * 4)?;
        let fc = read_u32(plc, descriptors + index * 8 + 2)?;
        if cp_end < cp_start {
            return Err(ExtractionError::failed("piece table is out of order"));
        }
        let compressed = fc & FC_COMPRESSED != 0;
        let raw_offset = (fc & !FC_COMPRESSED) as usize;
        pieces.push(Piece {
            cp_start,
            cp_end,
            offset: if compressed { raw_offset / 2 } else { raw_offset },
            compressed,
        });
    }
    Ok(pieces)
}

fn decode_piece(
    word: &[u8],
    piece: &Piece,
    chars: usize,
    out: &mut String,
) -> Result<(), ExtractionError> {
    let width = if piece.compressed { 1 } else { 2 };
    let bytes = word
        .get(piece.offset..piece.offset + chars * width)
        .ok_or_else(|| ExtractionError::failed("piece points outside the WordDocument stream"))?;
    if piece.compressed {
        out.extend(bytes.iter().map(|byte| match byte {
            0x80..=0x9F => CP1252_HIGH[(byte - 0x80) as usize],
            _ => char::from(*byte),
        }));
    } else {
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        out.extend(char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)));
    }
    Ok(())
}

/// Map Word's in-band control characters to text, dropping field instructions.
fn strip_field_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    // One entry per open field: true while still inside its instruction part.
    let mut fields: Vec<bool> = Vec::new();
    for c in text.chars() {
        match c {
            '\u{13}' => fields.push(true),
            '\u{14}' => {
                if let Some(top) = fields.last_mut() {
                    *top = false;
                }
            }
            '\u{15}' => {
                fields.pop();
            }
            _ if fields.iter().any(|in_instruction| *in_instruction) => {}
            '\r' | '\u{0B}' | '\u{0C}' => out.push('\n'),
            '\u{07}' => out.push('\t'),
            '\u{1E}' => out.push('-'),
            '\u{1F}' | '\u{01}' | '\u{08}' => {}
            other => out.push(other),
        }
    }
    out
}

fn read_u16(buffer: &[u8], offset: usize) -> Result<u16, ExtractionError> {
    buffer
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| ExtractionError::failed("Word structure is truncated"))
}

fn read_u32(buffer: &[u8], offset: usize) -> Result<u32, ExtractionError> {
    buffer
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ExtractionError::failed("Word structure is truncated"))
}

//! PNG text-chunk metadata.
//!
//! Works directly on the chunk stream so that pixel data and every
//! unrelated chunk are preserved byte-for-byte. Our metadata lives in
//! uncompressed `iTXt` chunks keyed by [`METADATA_KEYWORDS`]; any existing
//! text chunk with one of those keywords is removed before new ones are
//! written, which makes re-embedding idempotent.

use crate::error::CoreError;
use crate::generation::{GenerationParameters, ProjectDocument};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Plain-text parameter block.
pub const KEYWORD_PARAMETERS: &str = "parameters";
/// JSON-serialized [`GenerationParameters`].
pub const KEYWORD_PARAMETERS_JSON: &str = "parameters-json";
/// JSON-serialized [`ProjectDocument`].
pub const KEYWORD_PROJECT: &str = "smproj";

pub const METADATA_KEYWORDS: &[&str] =
    &[KEYWORD_PARAMETERS, KEYWORD_PARAMETERS_JSON, KEYWORD_PROJECT];

const CHUNK_TEXT: [u8; 4] = *b"tEXt";
const CHUNK_ITXT: [u8; 4] = *b"iTXt";
const CHUNK_ZTXT: [u8; 4] = *b"zTXt";
const CHUNK_IEND: [u8; 4] = *b"IEND";

/// Length + type + CRC.
const CHUNK_OVERHEAD: usize = 12;

// ---------------------------------------------------------------------------
// Chunk stream
// ---------------------------------------------------------------------------

/// One chunk as it appears in the file.
#[derive(Debug, Clone, Copy)]
struct RawChunk<'a> {
    kind: [u8; 4],
    data: &'a [u8],
    /// The complete chunk including length, type and CRC.
    raw: &'a [u8],
}

impl RawChunk<'_> {
    fn is_text(&self) -> bool {
        matches!(self.kind, CHUNK_TEXT | CHUNK_ITXT | CHUNK_ZTXT)
    }

    fn keyword(&self) -> Option<&[u8]> {
        if !self.is_text() {
            return None;
        }
        let end = self.data.iter().position(|&b| b == 0)?;
        Some(&self.data[..end])
    }

    fn has_metadata_keyword(&self) -> bool {
        self.keyword()
            .is_some_and(|k| METADATA_KEYWORDS.iter().any(|m| m.as_bytes() == k))
    }
}

fn malformed(reason: impl Into<String>) -> CoreError {
    CoreError::Malformed {
        format: "PNG",
        reason: reason.into(),
    }
}

fn parse_chunks(bytes: &[u8]) -> Result<Vec<RawChunk<'_>>, CoreError> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return Err(malformed("missing PNG signature"));
    }

    let mut chunks = Vec::new();
    let mut offset = PNG_SIGNATURE.len();

    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + 8)
            .ok_or_else(|| malformed(format!("truncated chunk header at offset {offset}")))?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];

        let end = offset
            .checked_add(length)
            .and_then(|n| n.checked_add(CHUNK_OVERHEAD))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| malformed(format!("chunk at offset {offset} overruns the file")))?;

        chunks.push(RawChunk {
            kind,
            data: &bytes[offset + 8..offset + 8 + length],
            raw: &bytes[offset..end],
        });
        offset = end;

        if kind == CHUNK_IEND {
            break;
        }
    }

    if chunks.last().map(|c| c.kind) != Some(CHUNK_IEND) {
        return Err(malformed("missing IEND chunk"));
    }
    Ok(chunks)
}

fn write_chunk(out: &mut Vec<u8>, kind: [u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&kind);
    out.extend_from_slice(data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

/// Uncompressed international text chunk body.
fn itxt_data(keyword: &str, text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
    data.extend_from_slice(keyword.as_bytes());
    // Null separator, compression flag, compression method.
    data.extend_from_slice(&[0, 0, 0]);
    // Empty language tag and translated keyword.
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(text.as_bytes());
    data
}

fn rebuild<'a, F>(chunks: &[RawChunk<'a>], keep: F, extra: &[(&str, String)]) -> Vec<u8>
where
    F: Fn(&RawChunk<'a>) -> bool,
{
    let mut out = Vec::with_capacity(
        PNG_SIGNATURE.len()
            + chunks.iter().map(|c| c.raw.len()).sum::<usize>()
            + extra.iter().map(|(k, v)| k.len() + v.len() + 5 + CHUNK_OVERHEAD).sum::<usize>(),
    );
    out.extend_from_slice(&PNG_SIGNATURE);

    for chunk in chunks {
        if chunk.kind == CHUNK_IEND {
            for (keyword, text) in extra {
                write_chunk(&mut out, CHUNK_ITXT, &itxt_data(keyword, text));
            }
        }
        if keep(chunk) {
            out.extend_from_slice(chunk.raw);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Embed parameters and project into a PNG, replacing any previous copy.
pub fn add_metadata(
    bytes: &[u8],
    parameters: &GenerationParameters,
    project: &ProjectDocument,
) -> Result<Vec<u8>, CoreError> {
    let chunks = parse_chunks(bytes)?;

    let entries = [
        (KEYWORD_PARAMETERS, parameters.to_parameters_text()),
        (KEYWORD_PARAMETERS_JSON, serde_json::to_string(parameters)?),
        (KEYWORD_PROJECT, serde_json::to_string(project)?),
    ];

    Ok(rebuild(&chunks, |c| !c.has_metadata_keyword(), &entries))
}

/// Remove every text chunk (`tEXt`, `iTXt`, `zTXt`).
///
/// Used before uploading input images, since some decoders on the engine
/// side choke on unusual text chunks.
pub fn strip_metadata(bytes: &[u8]) -> Result<Vec<u8>, CoreError> {
    let chunks = parse_chunks(bytes)?;
    Ok(rebuild(&chunks, |c| !c.is_text(), &[]))
}

/// Read all `tEXt` and uncompressed `iTXt` entries as `(keyword, text)`.
///
/// Compressed entries are skipped.
pub fn read_text_chunks(bytes: &[u8]) -> Result<Vec<(String, String)>, CoreError> {
    let chunks = parse_chunks(bytes)?;
    let mut entries = Vec::new();

    for chunk in chunks.iter().filter(|c| c.is_text()) {
        let Some(keyword) = chunk.keyword() else {
            continue;
        };
        let keyword_str: String = keyword.iter().map(|&b| b as char).collect();
        let rest = &chunk.data[keyword.len() + 1..];

        match chunk.kind {
            CHUNK_TEXT => {
                // Latin-1.
                entries.push((keyword_str, rest.iter().map(|&b| b as char).collect()));
            }
            CHUNK_ITXT => {
                if rest.first().copied().unwrap_or(1) != 0 {
                    continue;
                }
                // Skip flag + method, then language tag and translated keyword.
                let mut body = rest.get(2..).unwrap_or_default();
                for _ in 0..2 {
                    match body.iter().position(|&b| b == 0) {
                        Some(i) => body = &body[i + 1..],
                        None => body = &[],
                    }
                }
                entries.push((keyword_str, String::from_utf8_lossy(body).into_owned()));
            }
            _ => {}
        }
    }
    Ok(entries)
}

/// Convenience lookup of a single text entry.
pub fn read_text(bytes: &[u8], keyword: &str) -> Result<Option<String>, CoreError> {
    Ok(read_text_chunks(bytes)?
        .into_iter()
        .find(|(k, _)| k == keyword)
        .map(|(_, v)| v))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

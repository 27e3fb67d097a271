//! WEBP EXIF metadata.
//!
//! Writes an `EXIF` chunk whose IFD0 carries `ImageDescription` and
//! `Software` ASCII tags. Simple-format files (`VP8 ` / `VP8L` only) are
//! promoted to the extended format by prepending a `VP8X` chunk, since
//! metadata chunks are only valid there.

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// EXIF `ImageDescription` tag.
pub const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
/// EXIF `Software` tag.
pub const TAG_SOFTWARE: u16 = 0x0131;

const FOURCC_VP8: [u8; 4] = *b"VP8 ";
const FOURCC_VP8L: [u8; 4] = *b"VP8L";
const FOURCC_VP8X: [u8; 4] = *b"VP8X";
const FOURCC_EXIF: [u8; 4] = *b"EXIF";

const VP8X_FLAG_EXIF: u8 = 0x08;
const VP8X_FLAG_ALPHA: u8 = 0x10;

const TIFF_TYPE_ASCII: u16 = 2;

/// Some writers prefix the TIFF block with the JPEG APP1 marker text.
const EXIF_HEADER: &[u8] = b"Exif\0\0";

// ---------------------------------------------------------------------------
// RIFF container
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Chunk {
    fourcc: [u8; 4],
    payload: Vec<u8>,
}

fn malformed(reason: impl Into<String>) -> CoreError {
    CoreError::Malformed {
        format: "WEBP",
        reason: reason.into(),
    }
}

fn parse_riff(bytes: &[u8]) -> Result<Vec<Chunk>, CoreError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err(malformed("missing RIFF/WEBP header"));
    }
    let riff_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let end = (riff_size + 8).min(bytes.len());

    let mut chunks = Vec::new();
    let mut offset = 12;
    while offset + 8 <= end {
        let fourcc = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let start = offset + 8;
        let payload = bytes
            .get(start..start + size)
            .ok_or_else(|| malformed(format!("chunk at offset {offset} overruns the file")))?;
        chunks.push(Chunk {
            fourcc,
            payload: payload.to_vec(),
        });
        offset = start + size + (size & 1);
    }

    if chunks.is_empty() {
        return Err(malformed("no chunks"));
    }
    Ok(chunks)
}

fn write_riff(chunks: &[Chunk]) -> Vec<u8> {
    let body_len: usize = chunks
        .iter()
        .map(|c| 8 + c.payload.len() + (c.payload.len() & 1))
        .sum();

    let mut out = Vec::with_capacity(12 + body_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((body_len + 4) as u32).to_le_bytes());
    out.extend_from_slice(b"WEBP");
    for chunk in chunks {
        out.extend_from_slice(&chunk.fourcc);
        out.extend_from_slice(&(chunk.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&chunk.payload);
        if chunk.payload.len() & 1 == 1 {
            out.push(0);
        }
    }
    out
}

/// Canvas width, height and alpha usage of a simple-format bitstream.
fn bitstream_info(chunk: &Chunk) -> Result<(u32, u32, bool), CoreError> {
    let p = &chunk.payload;
    match chunk.fourcc {
        FOURCC_VP8 => {
            if p.len() < 10 || p[3..6] != [0x9d_u8, 0x01, 0x2a] {
                return Err(malformed("invalid VP8 frame header"));
            }
            let width = u16::from_le_bytes([p[6], p[7]]) & 0x3FFF;
            let height = u16::from_le_bytes([p[8], p[9]]) & 0x3FFF;
            if width == 0 || height == 0 {
                return Err(malformed("zero VP8 dimensions"));
            }
            Ok((width as u32, height as u32, false))
        }
        FOURCC_VP8L => {
            if p.len() < 5 || p[0] != 0x2F {
                return Err(malformed("invalid VP8L signature"));
            }
            let bits = u32::from_le_bytes([p[1], p[2], p[3], p[4]]);
            let width = (bits & 0x3FFF) + 1;
            let height = ((bits >> 14) & 0x3FFF) + 1;
            let alpha = (bits >> 28) & 1 == 1;
            Ok((width, height, alpha))
        }
        other => Err(malformed(format!(
            "unexpected first chunk '{}'",
            String::from_utf8_lossy(&other)
        ))),
    }
}

fn vp8x_payload(width: u32, height: u32, flags: u8) -> Vec<u8> {
    let mut payload = vec![flags, 0, 0, 0];
    payload.extend_from_slice(&(width - 1).to_le_bytes()[..3]);
    payload.extend_from_slice(&(height - 1).to_le_bytes()[..3]);
    payload
}

// ---------------------------------------------------------------------------
// EXIF (TIFF) block
// ---------------------------------------------------------------------------

/// Build a little-endian TIFF block with a single IFD of ASCII tags.
///
/// `tags` must be sorted by tag id.
fn build_exif(tags: &[(u16, &str)]) -> Vec<u8> {
    let ifd_len = 2 + tags.len() * 12 + 4;
    let mut data_offset = 8 + ifd_len;

    let mut ifd = Vec::with_capacity(ifd_len);
    let mut data = Vec::new();
    ifd.extend_from_slice(&(tags.len() as u16).to_le_bytes());

    for (tag, value) in tags {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        let count = bytes.len() as u32;

        ifd.extend_from_slice(&tag.to_le_bytes());
        ifd.extend_from_slice(&TIFF_TYPE_ASCII.to_le_bytes());
        ifd.extend_from_slice(&count.to_le_bytes());

        if bytes.len() <= 4 {
            bytes.resize(4, 0);
            ifd.extend_from_slice(&bytes);
        } else {
            ifd.extend_from_slice(&(data_offset as u32).to_le_bytes());
            if bytes.len() & 1 == 1 {
                bytes.push(0);
            }
            data_offset += bytes.len();
            data.extend_from_slice(&bytes);
        }
    }
    // No next IFD.
    ifd.extend_from_slice(&0u32.to_le_bytes());

    let mut out = Vec::with_capacity(8 + ifd.len() + data.len());
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&ifd);
    out.extend_from_slice(&data);
    out
}

/// ASCII fields read back from an EXIF block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifFields {
    pub image_description: Option<String>,
    pub software: Option<String>,
}

fn parse_exif(block: &[u8]) -> Result<ExifFields, CoreError> {
    let tiff = block.strip_prefix(EXIF_HEADER).unwrap_or(block);
    let bad = || malformed("truncated EXIF block");

    let little = match tiff.get(0..2) {
        Some(b"II") => true,
        Some(b"MM") => false,
        _ => return Err(malformed("invalid TIFF byte order")),
    };
    let u16_at = |at: usize| -> Result<u16, CoreError> {
        let b = tiff.get(at..at + 2).ok_or_else(bad)?;
        Ok(if little {
            u16::from_le_bytes([b[0], b[1]])
        } else {
            u16::from_be_bytes([b[0], b[1]])
        })
    };
    let u32_at = |at: usize| -> Result<u32, CoreError> {
        let b = tiff.get(at..at + 4).ok_or_else(bad)?;
        Ok(if little {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        })
    };

    let ifd = u32_at(4)? as usize;
    let count = u16_at(ifd)? as usize;
    let mut fields = ExifFields::default();

    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        let tag = u16_at(entry)?;
        if u16_at(entry + 2)? != TIFF_TYPE_ASCII {
            continue;
        }
        let len = u32_at(entry + 4)? as usize;
        let start = if len <= 4 {
            entry + 8
        } else {
            u32_at(entry + 8)? as usize
        };
        let raw = tiff.get(start..start + len).ok_or_else(bad)?;
        let text = String::from_utf8_lossy(raw.split(|&b| b == 0).next().unwrap_or_default())
            .into_owned();

        match tag {
            TAG_IMAGE_DESCRIPTION => fields.image_description = Some(text),
            TAG_SOFTWARE => fields.software = Some(text),
            _ => {}
        }
    }
    Ok(fields)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Write `description` and `software` into the file's EXIF block,
/// replacing any existing one.
pub fn add_exif_metadata(
    bytes: &[u8],
    description: &str,
    software: &str,
) -> Result<Vec<u8>, CoreError> {
    let mut chunks = parse_riff(bytes)?;
    chunks.retain(|c| c.fourcc != FOURCC_EXIF);

    match chunks.first_mut() {
        Some(first) if first.fourcc == FOURCC_VP8X => {
            if first.payload.is_empty() {
                return Err(malformed("empty VP8X chunk"));
            }
            first.payload[0] |= VP8X_FLAG_EXIF;
        }
        Some(first) => {
            let (width, height, alpha) = bitstream_info(first)?;
            let mut flags = VP8X_FLAG_EXIF;
            if alpha {
                flags |= VP8X_FLAG_ALPHA;
            }
            chunks.insert(
                0,
                Chunk {
                    fourcc: FOURCC_VP8X,
                    payload: vp8x_payload(width, height, flags),
                },
            );
        }
        None => return Err(malformed("no chunks")),
    }

    chunks.push(Chunk {
        fourcc: FOURCC_EXIF,
        payload: build_exif(&[
            (TAG_IMAGE_DESCRIPTION, description),
            (TAG_SOFTWARE, software),
        ]),
    });

    Ok(write_riff(&chunks))
}

/// Read the `ImageDescription` / `Software` tags, if the file has EXIF.
pub fn read_exif_fields(bytes: &[u8]) -> Result<Option<ExifFields>, CoreError> {
    parse_riff(bytes)?
        .iter()
        .find(|c| c.fourcc == FOURCC_EXIF)
        .map(|c| parse_exif(&c.payload))
        .transpose()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Per-sector compression codec.
//!
//! Each sector of a member file is compressed independently so that readers
//! can decompress an arbitrary sector without touching its predecessors. This
//! profile writes zlib (deflate) sectors carrying the standard MPQ method
//! byte; sectors that would not shrink are stored raw, which the reader
//! detects by the packed length equaling the unpacked length. Reading also
//! accepts PKWare-imploded sectors so that retail-era archives stay usable.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::format::BlockFlags;

/// Method byte of a zlib-compressed sector.
const METHOD_ZLIB: u8 = 0x02;

#[derive(Error, Debug)]
pub enum SectorError {
    #[error("sector does not decompress to its declared size ({actual} != {declared})")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown sector compression method {0:#04x}")]
    UnknownMethod(u8),
    #[error("sector is empty but a payload was declared")]
    Truncated,
    #[error("corrupt deflate stream: {0}")]
    Deflate(#[source] io::Error),
    #[error("corrupt imploded stream: {0}")]
    Implode(String),
}

/// Compresses one sector for storage. Returns the raw input when compression
/// does not make it strictly smaller.
pub fn compress_sector(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(raw)?;
    let deflated = encoder.finish()?;

    if deflated.len() + 1 < raw.len() {
        let mut stored = Vec::with_capacity(deflated.len() + 1);
        stored.push(METHOD_ZLIB);
        stored.extend_from_slice(&deflated);
        Ok(stored)
    } else {
        Ok(raw.to_vec())
    }
}

/// Decompresses one stored sector into exactly `declared_len` bytes.
pub fn decompress_sector(
    packed: &[u8],
    declared_len: usize,
    flags: BlockFlags,
) -> Result<Vec<u8>, SectorError> {
    // Raw storage: the sector did not shrink when it was written.
    if packed.len() == declared_len {
        return Ok(packed.to_vec());
    }

    if flags.contains(BlockFlags::COMPRESSED) {
        let (method, body) = packed.split_first().ok_or(SectorError::Truncated)?;
        let out = match *method {
            METHOD_ZLIB => {
                let mut out = Vec::with_capacity(declared_len);
                ZlibDecoder::new(body)
                    .read_to_end(&mut out)
                    .map_err(SectorError::Deflate)?;
                out
            }
            other => return Err(SectorError::UnknownMethod(other)),
        };
        return check_len(out, declared_len);
    }

    if flags.contains(BlockFlags::IMPLODED) {
        let out = explode::explode(packed).map_err(|e| SectorError::Implode(format!("{e:?}")))?;
        return check_len(out, declared_len);
    }

    // An uncompressed sector whose stored size disagrees with its declared
    // size has no valid interpretation.
    Err(SectorError::LengthMismatch {
        declared: declared_len,
        actual: packed.len(),
    })
}

fn check_len(out: Vec<u8>, declared_len: usize) -> Result<Vec<u8>, SectorError> {
    if out.len() == declared_len {
        Ok(out)
    } else {
        Err(SectorError::LengthMismatch {
            declared: declared_len,
            actual: out.len(),
        })
    }
}

//! Per-chunk zlib compression.
//!
//! Every chunk goes through the codec, level 0 included: a level-0 stream
//! is stored blocks inside a zlib envelope, so both peers always agree on
//! the payload format.

use std::io::{self, Read};

use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};

/// Compresses `data` at `level` (0-9).
pub fn compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(data, Compression::new(level.min(9)));
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Inflates `data`, failing once the output would exceed `limit` bytes.
/// At most `limit + 1` bytes are ever produced.
pub fn decompress(data: &[u8], limit: u64) -> io::Result<Vec<u8>> {
    let capacity = limit.min(data.len() as u64 * 2).min(1 << 20) as usize;
    let mut out = Vec::with_capacity(capacity);
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inflates past {limit} bytes"),
        ));
    }
    Ok(out)
}

/// Worst-case zlib output size for `len` input bytes (zlib's `compressBound`).
pub fn deflate_bound(len: u64) -> u64 {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

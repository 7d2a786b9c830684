//! Binary framing for content channel messages.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: chunk index]
//! [2 bytes BE: block index]
//! [1 byte:     last-block flag, 0x00 or 0x01]
//! [payload bytes]
//! ```
//!
//! A chunk is split into at most [`MAX_BLOCKS_PER_CHUNK`] blocks; the
//! receiver learns the block count from the block carrying the last-block
//! flag.

use crate::constants::{MAX_BLOCKS_PER_CHUNK, PACKET_HEADER_LEN};

/// Errors produced when decoding or planning packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes (header is {PACKET_HEADER_LEN})")]
    Truncated(usize),

    #[error("invalid last-block flag: {0:#04x}")]
    InvalidFlag(u8),

    #[error("chunk needs {blocks} blocks (max {MAX_BLOCKS_PER_CHUNK})")]
    TooManyBlocks { blocks: usize },
}

/// A decoded packet borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub chunk_index: u32,
    pub block_index: u16,
    pub is_last_block: bool,
    pub payload: &'a [u8],
}

/// Frames one block of a chunk.
pub fn build_packet(chunk_index: u32, block_index: u16, is_last_block: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
    buf.extend_from_slice(&chunk_index.to_be_bytes());
    buf.extend_from_slice(&block_index.to_be_bytes());
    buf.push(u8::from(is_last_block));
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a packet produced by [`build_packet`].
pub fn read_packet(bytes: &[u8]) -> Result<Packet<'_>, PacketError> {
    if bytes.len() < PACKET_HEADER_LEN {
        return Err(PacketError::Truncated(bytes.len()));
    }
    let chunk_index = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let block_index = u16::from_be_bytes([bytes[4], bytes[5]]);
    let is_last_block = match bytes[6] {
        0 => false,
        1 => true,
        other => return Err(PacketError::InvalidFlag(other)),
    };
    Ok(Packet {
        chunk_index,
        block_index,
        is_last_block,
        payload: &bytes[PACKET_HEADER_LEN..],
    })
}

/// Splits `data` into framed blocks of at most `block_size` payload bytes.
///
/// An empty `data` still yields one (empty) last block so the receiver can
/// complete the chunk.
pub fn split_into_packets(
    chunk_index: u32,
    data: &[u8],
    block_size: usize,
) -> Result<Vec<Vec<u8>>, PacketError> {
    let block_size = block_size.max(1);
    let blocks = data.len().div_ceil(block_size).max(1);
    if blocks > MAX_BLOCKS_PER_CHUNK {
        return Err(PacketError::TooManyBlocks { blocks });
    }
    if data.is_empty() {
        return Ok(vec![build_packet(chunk_index, 0, true, &[])]);
    }
    Ok(data
        .chunks(block_size)
        .enumerate()
        .map(|(i, block)| build_packet(chunk_index, i as u16, i + 1 == blocks, block))
        .collect())
}

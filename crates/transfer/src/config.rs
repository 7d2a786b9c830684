use std::time::Duration;

use peerdrop_protocol::ChunkMetadata;
use peerdrop_protocol::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_READY_INTERVAL, DEFAULT_REQUEST_INTERVAL, MAX_BLOCKS_PER_CHUNK,
};

use crate::TransferError;
use crate::compression::deflate_bound;

/// Tunables for a [`FileTransmitter`](crate::FileTransmitter).
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Payload bytes per framed block.
    pub block_size: usize,
    /// zlib level, 0-9.
    pub compression_level: u32,
    /// A channel is available for sending while its buffered amount is at
    /// or below this many bytes.
    pub low_water_mark: usize,
    /// Compressed chunks held ahead of the sender.
    pub pipeline_depth: usize,
    /// Receiver: interval between `request-content` messages.
    pub request_interval: Duration,
    /// Receiver: delay of the next request once the first byte arrives.
    pub first_data_request_delay: Duration,
    /// Receiver: interval between `ready` announcements before any data.
    pub ready_interval: Duration,
    /// Longest wait for channels to flush before sending `complete`.
    pub drain_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression_level: 6,
            low_water_mark: 256 * 1024,
            pipeline_depth: 2,
            request_interval: DEFAULT_REQUEST_INTERVAL,
            first_data_request_delay: Duration::from_secs(2),
            ready_interval: DEFAULT_READY_INTERVAL,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl TransferConfig {
    /// Checks the settings on their own.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.block_size == 0 {
            return Err(TransferError::InvalidConfig("block_size must be positive".into()));
        }
        if self.compression_level > 9 {
            return Err(TransferError::InvalidConfig(format!(
                "compression_level {} is outside 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }

    /// Checks that every chunk of `meta` fits the packet format: at most
    /// 65536 blocks after worst-case compression, and a `u32` chunk index.
    pub fn validate_for(&self, meta: &ChunkMetadata) -> Result<(), TransferError> {
        self.validate()?;
        if meta.file_size > 0 && meta.chunk_size == 0 {
            return Err(TransferError::InvalidConfig("chunk_size must be positive".into()));
        }
        let blocks = deflate_bound(meta.chunk_size).div_ceil(self.block_size as u64);
        if blocks > MAX_BLOCKS_PER_CHUNK as u64 {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} needs up to {blocks} blocks of {} bytes (max {MAX_BLOCKS_PER_CHUNK})",
                meta.chunk_size, self.block_size
            )));
        }
        if meta.chunk_count() > u64::from(u32::MAX) + 1 {
            return Err(TransferError::InvalidConfig(format!(
                "{} chunks exceed the 32-bit chunk index",
                meta.chunk_count()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chunk_size: u64) -> ChunkMetadata {
        ChunkMetadata {
            id: "t".into(),
            file_name: "f".into(),
            file_size: chunk_size * 4,
            chunk_size,
            mime_type: None,
            last_modified: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = TransferConfig::default();
        config.validate().unwrap();
        config.validate_for(&meta(256 * 1024)).unwrap();
    }

    #[test]
    fn rejects_chunk_needing_too_many_blocks() {
        let config = TransferConfig {
            block_size: 1,
            ..TransferConfig::default()
        };
        let err = config.validate_for(&meta(65_536)).unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfig(_)));

        let roomy = TransferConfig {
            block_size: 16,
            ..TransferConfig::default()
        };
        roomy.validate_for(&meta(65_536)).unwrap();
    }

    #[test]
    fn rejects_bad_level_and_block_size() {
        let bad_level = TransferConfig {
            compression_level: 10,
            ..TransferConfig::default()
        };
        assert!(bad_level.validate().is_err());

        let no_blocks = TransferConfig {
            block_size: 0,
            ..TransferConfig::default()
        };
        assert!(no_blocks.validate().is_err());
    }
}

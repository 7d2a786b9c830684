//! Resumable file transfer over parallel data channels.
//!
//! A [`FileTransmitter`] drives one side of one transfer. The sender reads
//! chunks from its [`ChunkCache`](peerdrop_chunk_cache::ChunkCache),
//! compresses them, splits them into framed blocks and spreads the blocks
//! over every attached channel. The receiver reassembles blocks into
//! chunks, stores them, and periodically asks for whatever is still
//! missing, which is how lost blocks, restarts and reconnects are all
//! recovered.

mod compression;
mod config;
mod progress;
mod receive;
mod registry;
mod scheduler;
mod send;
mod transmitter;
mod types;

pub use compression::{compress, decompress, deflate_bound};
pub use config::TransferConfig;
pub use progress::SpeedCalculator;
pub use registry::TransferRegistry;
pub use scheduler::ChannelScheduler;
pub use transmitter::FileTransmitter;
pub use types::{Mode, TransferEvent, TransferStatus};

use peerdrop_chunk_cache::CacheError;
use peerdrop_data_channel::DataChannelError;
use peerdrop_protocol::PacketError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Channel(#[from] DataChannelError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("no metadata for transfer {0}")]
    NoMetadata(String),

    #[error("operation not supported in {0:?} mode")]
    WrongMode(Mode),

    #[error("no open channels")]
    NoChannels,

    #[error("chunk {0} not available to send")]
    MissingChunk(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Join(String),
}

//! Error types for data channels.

use crate::ChannelState;

/// Errors produced by a data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("channel is not open (state: {0:?})")]
    NotOpen(ChannelState),

    #[error("channel closed")]
    Closed,

    #[error("timed out waiting for channel")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

//! Message-oriented data channels.
//!
//! A [`DataChannel`] is an ordered, reliable, message-framed byte pipe in
//! the shape of a WebRTC data channel: it carries text and binary messages,
//! reports how many bytes are queued for sending, and announces state
//! changes through an event subscription. Peer sessions produce them,
//! file transmitters consume them.
//!
//! [`memory::MemoryChannel`] is an in-process implementation used by tests
//! and by the loopback mode of the CLI.

pub mod error;
pub mod label;
pub mod memory;

pub use error::DataChannelError;
pub use label::{ChannelKind, TransferLabel};
pub use memory::MemoryChannel;

use std::sync::Arc;
use std::time::Duration;

use peerdrop_protocol::Subscription;
use serde::Serialize;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Size counted against the channel's buffered amount.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notifications raised by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    /// Buffered amount fell to or below the low-water threshold.
    BufferedAmountLow,
    Closed,
    Error(String),
}

/// An ordered message channel to a remote peer.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Queues one message for delivery.
    fn send(&self, payload: Payload) -> Result<(), DataChannelError>;

    /// Bytes queued locally and not yet handed to the transport.
    fn buffered_amount(&self) -> usize;

    fn buffered_amount_low_threshold(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Subscribes to events raised after this call.
    fn subscribe(&self) -> Subscription<ChannelEvent>;

    fn close(&self);
}

/// Shared handle to any channel implementation.
pub type SharedChannel = Arc<dyn DataChannel>;

/// Serializes `message` as JSON and sends it as a text message.
pub fn send_message<T: Serialize + ?Sized>(
    channel: &dyn DataChannel,
    message: &T,
) -> Result<(), DataChannelError> {
    let text = serde_json::to_string(message)?;
    channel.send(Payload::Text(text))
}

/// Waits until `channel` is open.
pub async fn wait_open(channel: &dyn DataChannel, timeout: Duration) -> Result<(), DataChannelError> {
    let mut events = channel.subscribe();
    match channel.state() {
        ChannelState::Open => return Ok(()),
        ChannelState::Closing | ChannelState::Closed => return Err(DataChannelError::Closed),
        ChannelState::Connecting => {}
    }

    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => return Ok(()),
                ChannelEvent::Closed => return Err(DataChannelError::Closed),
                ChannelEvent::Error(e) => return Err(DataChannelError::Transport(e)),
                _ => {}
            }
        }
        Err(DataChannelError::Closed)
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| DataChannelError::Timeout)?
}

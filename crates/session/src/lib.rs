//! Peer sessions over a WebRTC-style connection.
//!
//! A [`PeerSession`] owns one [`PeerConnection`] to one remote client. It
//! negotiates with the "perfect negotiation" pattern, so either side may
//! offer at any time and simultaneous offers resolve without coordination,
//! reconnects with exponential backoff after transient failures, and sorts
//! incoming data channels into the control channel and per-transfer
//! content channels.

pub mod connection;
pub mod mock;
mod negotiation;
mod reconnection;
mod session;
pub mod signaling;
pub mod types;

pub use connection::{IceCandidate, PcEvent, PcState, PeerConnection, SdpType, SessionDescription, SignalingState};
pub use session::PeerSession;
pub use signaling::{Signal, SignalingChannel};
pub use types::{ReconnectConfig, Role, SessionConfig, SessionEvent, SessionState};

use peerdrop_data_channel::DataChannelError;

/// Errors raised by a [`PeerConnection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("peer connection is closed")]
    Closed,

    #[error("cannot {op} in signaling state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },

    #[error("no remote description")]
    NoRemoteDescription,

    #[error("{0}")]
    Other(String),
}

/// Errors raised by a [`SignalingChannel`].
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,

    #[error("signaling transport: {0}")]
    Transport(String),
}

/// Errors returned by [`PeerSession`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Channel(#[from] DataChannelError),

    #[error("connection {0:?}")]
    ConnectFailed(PcState),

    #[error("timed out waiting for connection")]
    Timeout,

    #[error("no open control channel")]
    NoControlChannel,

    #[error("session destroyed")]
    Destroyed,
}

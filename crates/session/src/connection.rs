//! The peer-connection primitive a session drives.
//!
//! Shaped after a WebRTC `RTCPeerConnection`: descriptions, ICE
//! candidates, a signaling state machine and data channels. ICE itself and
//! the media transport live behind this trait.

use std::fmt;

use futures_util::future::BoxFuture;
use peerdrop_data_channel::SharedChannel;
use peerdrop_protocol::Subscription;
use serde::{Deserialize, Serialize};

use crate::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone)]
pub enum PcEvent {
    ConnectionState(PcState),
    /// A local candidate to relay to the remote.
    IceCandidate(IceCandidate),
    NegotiationNeeded,
    /// The remote opened a channel.
    DataChannel(SharedChannel),
}

impl fmt::Debug for PcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            Self::DataChannel(c) => f.debug_tuple("DataChannel").field(&c.label()).finish(),
        }
    }
}

/// A WebRTC-compatible peer connection.
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PcState;

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, ConnectionError>>;

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, ConnectionError>>;

    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<(), ConnectionError>>;

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Fails when no remote description is set.
    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Makes the next offer gather fresh ICE credentials.
    fn restart_ice(&self);

    fn create_data_channel(&self, label: &str) -> Result<SharedChannel, ConnectionError>;

    fn subscribe(&self) -> Subscription<PcEvent>;

    fn close(&self);
}

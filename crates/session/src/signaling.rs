//! Out-of-band signaling between two clients.

use futures_util::future::BoxFuture;
use peerdrop_protocol::Subscription;
use serde::{Deserialize, Serialize};

use crate::SignalingError;
use crate::connection::IceCandidate;

/// One signaling message, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Signal {
    /// SDP of an offer.
    Offer(String),
    /// SDP of an answer.
    Answer(String),
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Relays signals to one remote client.
pub trait SignalingChannel: Send + Sync {
    fn session_id(&self) -> &str;

    fn client_id(&self) -> &str;

    fn target_client_id(&self) -> &str;

    fn send(&self, signal: Signal) -> BoxFuture<'_, Result<(), SignalingError>>;

    /// Signals from the remote, received after this call.
    fn subscribe(&self) -> Subscription<Signal>;
}

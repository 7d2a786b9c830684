//! JSON control messages exchanged on content channels.
//!
//! Binary messages on the same channels are framed packets (see
//! [`crate::packet`]); text messages are one of the variants below, tagged
//! by a `type` field.

use serde::{Deserialize, Serialize};

use crate::ranges::RangeSet;
use crate::types::ChunkMetadata;

/// Control message on a transfer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferMessage {
    /// File metadata, sent by the sender.
    Head(ChunkMetadata),
    /// Chunks the receiver still needs.
    RequestContent { ranges: RangeSet },
    /// Receiver asks for [`TransferMessage::Head`].
    RequestHead,
    /// The peer finished its side of the transfer.
    Complete,
    /// The receiver is listening on this channel.
    Ready,
}

impl TransferMessage {
    /// Encodes the message as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a message from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Head(_) => "head",
            Self::RequestContent { .. } => "request-content",
            Self::RequestHead => "request-head",
            Self::Complete => "complete",
            Self::Ready => "ready",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::merge;

    #[test]
    fn unit_messages_carry_only_type() {
        assert_eq!(TransferMessage::Ready.to_json().unwrap(), r#"{"type":"ready"}"#);
        assert_eq!(
            TransferMessage::Complete.to_json().unwrap(),
            r#"{"type":"complete"}"#
        );
        assert_eq!(
            TransferMessage::RequestHead.to_json().unwrap(),
            r#"{"type":"request-head"}"#
        );
    }

    #[test]
    fn head_flattens_metadata() {
        let msg = TransferMessage::Head(ChunkMetadata {
            id: "f1".into(),
            file_name: "photo.jpg".into(),
            file_size: 5000,
            chunk_size: 1024,
            mime_type: Some("image/jpeg".into()),
            last_modified: Some(1_700_000_000_000),
        });
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "head");
        assert_eq!(json["id"], "f1");
        assert_eq!(json["fileName"], "photo.jpg");
        assert_eq!(json["lastModified"], 1_700_000_000_000i64);

        let back = TransferMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn request_content_ranges() {
        let msg = TransferMessage::from_json(r#"{"type":"request-content","ranges":[[0,1],5]}"#)
            .unwrap();
        assert_eq!(
            msg,
            TransferMessage::RequestContent {
                ranges: merge(&[0, 1, 5])
            }
        );
        assert_eq!(msg.kind(), "request-content");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(TransferMessage::from_json(r#"{"type":"bogus"}"#).is_err());
        assert!(TransferMessage::from_json("not json").is_err());
    }
}

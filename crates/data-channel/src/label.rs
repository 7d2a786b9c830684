//! Channel labels.
//!
//! The control channel is labelled `message`. Content channels for a
//! transfer are labelled `file:<transfer id>:<n>`, where `n` tells apart
//! parallel channels of the same transfer. Transfer ids may themselves
//! contain `:`; the disambiguator is always the last segment.

use std::fmt;

use peerdrop_protocol::constants::{CONTROL_CHANNEL_LABEL, TRANSFER_CHANNEL_PREFIX};

/// Label of one content channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferLabel {
    pub transfer_id: String,
    pub index: usize,
}

impl TransferLabel {
    pub fn new(transfer_id: impl Into<String>, index: usize) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            index,
        }
    }

    /// Parses `file:<id>:<n>`; `None` for any other label.
    pub fn parse(label: &str) -> Option<Self> {
        let rest = label.strip_prefix(TRANSFER_CHANNEL_PREFIX)?;
        let (id, index) = rest.rsplit_once(':')?;
        if id.is_empty() {
            return None;
        }
        let index = index.parse().ok()?;
        Some(Self::new(id, index))
    }
}

impl fmt::Display for TransferLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TRANSFER_CHANNEL_PREFIX}{}:{}", self.transfer_id, self.index)
    }
}

/// What a channel is used for, derived from its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Transfer(TransferLabel),
    Other(String),
}

impl ChannelKind {
    pub fn classify(label: &str) -> Self {
        if label == CONTROL_CHANNEL_LABEL {
            Self::Control
        } else if let Some(transfer) = TransferLabel::parse(label) {
            Self::Transfer(transfer)
        } else {
            Self::Other(label.to_string())
        }
    }
}

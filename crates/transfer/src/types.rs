use peerdrop_protocol::{ChunkMetadata, Progress};

/// Direction of a transfer, fixed when the transmitter is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Send,
    Receive,
}

/// Transfer lifecycle.
///
/// `New -> Ready -> Process`, back to `Ready` on pause, `Complete` when
/// done. `Error` when every channel is lost before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    New,
    Ready,
    Process,
    Complete,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Notifications raised by a [`FileTransmitter`](crate::FileTransmitter).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StatusChanged(TransferStatus),
    /// Receiver learned (or re-learned) the file metadata.
    Head(ChunkMetadata),
    Progress(Progress),
    /// The remote side reported `complete`.
    RemoteComplete,
    /// This side finished: every requested chunk sent and drained, or
    /// every chunk received and stored.
    Complete,
    Error(String),
}

//! Protocol-wide constants.

use std::time::Duration;

/// Size of the binary packet header in bytes.
pub const PACKET_HEADER_LEN: usize = 7;

/// Hard upper bound on blocks per chunk (the block index is a `u16`).
pub const MAX_BLOCKS_PER_CHUNK: usize = 1 << 16;

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

/// Default block size: 16 KiB, a safe single-message size on data channels.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Label of the control channel carrying application JSON messages.
pub const CONTROL_CHANNEL_LABEL: &str = "message";

/// Prefix of content channel labels (`file:<transfer id>:<n>`).
pub const TRANSFER_CHANNEL_PREFIX: &str = "file:";

/// Default interval between receiver `request-content` messages.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between receiver `ready` announcements.
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_secs(1);

//! Wire protocol for peerdrop file transfers.
//!
//! Everything two peers must agree on lives here: the sparse range encoding
//! used to describe present/missing chunks, the binary packet header carried
//! on content channels, the JSON control messages, and the file metadata
//! exchanged before content flows.

pub mod constants;
pub mod events;
pub mod messages;
pub mod packet;
pub mod ranges;
pub mod types;

pub use events::{EventBus, Subscription};
pub use messages::TransferMessage;
pub use packet::{Packet, PacketError, build_packet, read_packet, split_into_packets};
pub use ranges::{ChunkRange, RangeSet, complement, merge};
pub use types::{ChunkMetadata, Progress};

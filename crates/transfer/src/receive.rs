//! Receiving side: block reassembly, periodic requests and completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use peerdrop_data_channel::{DataChannel, SharedChannel};
use peerdrop_protocol::{ChunkMetadata, Packet, TransferMessage, read_packet};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::compression::decompress;
use crate::transmitter::Inner;
use crate::types::{Mode, TransferEvent, TransferStatus};

#[derive(Default)]
pub(crate) struct ReceiveState {
    buffers: Mutex<HashMap<u32, ChunkBuffer>>,
    got_data: AtomicBool,
    first_data: Notify,
    pub(crate) request_now: Notify,
    completed: AtomicBool,
}

impl ReceiveState {
    pub(crate) fn has_data(&self) -> bool {
        self.got_data.load(Ordering::SeqCst)
    }

    pub(crate) fn partial_chunks(&self) -> usize {
        self.buffers.lock().len()
    }

    fn discard(&self, chunk_index: u32) {
        self.buffers.lock().remove(&chunk_index);
    }
}

/// Blocks of one chunk seen so far.
#[derive(Default)]
struct ChunkBuffer {
    blocks: BTreeMap<u16, Vec<u8>>,
    /// Known once the last block arrives.
    expected: Option<usize>,
}

impl ChunkBuffer {
    /// Adds a block; `false` if it contradicts blocks already seen.
    fn insert(&mut self, packet: &Packet<'_>) -> bool {
        let position = usize::from(packet.block_index);
        if let Some(expected) = self.expected {
            if position >= expected {
                return false;
            }
        }
        if packet.is_last_block {
            let expected = position + 1;
            if self.blocks.keys().next_back().is_some_and(|&k| usize::from(k) >= expected) {
                return false;
            }
            self.expected = Some(expected);
        }
        self.blocks.insert(packet.block_index, packet.payload.to_vec());
        true
    }

    fn is_complete(&self) -> bool {
        self.expected == Some(self.blocks.len())
    }

    fn assemble(self) -> Vec<u8> {
        let len = self.blocks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for block in self.blocks.into_values() {
            out.extend_from_slice(&block);
        }
        out
    }
}

impl Inner {
    pub(crate) async fn on_binary(self: &Arc<Self>, channel: &SharedChannel, bytes: Vec<u8>) {
        if self.mode != Mode::Receive {
            warn!(transfer = %self.id, label = channel.label(), "sender got binary data, dropping");
            return;
        }
        let packet = match read_packet(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(transfer = %self.id, error = %e, "dropping malformed packet");
                return;
            }
        };
        let Some(meta) = self.cache.meta() else {
            debug!(transfer = %self.id, "data before head, requesting head");
            self.send_on(channel.as_ref(), &TransferMessage::RequestHead);
            return;
        };
        let index = u64::from(packet.chunk_index);
        if index >= meta.chunk_count() {
            warn!(transfer = %self.id, chunk = index, "chunk index out of range, dropping");
            return;
        }
        self.note_data();
        if self.cache.has_chunk(index) {
            trace!(transfer = %self.id, chunk = index, block = packet.block_index, "chunk already stored, dropping block");
            self.recv.discard(packet.chunk_index);
            return;
        }

        let assembled = {
            let mut buffers = self.recv.buffers.lock();
            let buffer = buffers.entry(packet.chunk_index).or_default();
            if !buffer.insert(&packet) {
                warn!(transfer = %self.id, chunk = index, block = packet.block_index, "inconsistent block, dropping");
                None
            } else if buffer.is_complete() {
                buffers.remove(&packet.chunk_index).map(ChunkBuffer::assemble)
            } else {
                None
            }
        };
        if let Some(compressed) = assembled {
            self.store_received(&meta, index, compressed).await;
        }
    }

    fn note_data(&self) {
        if !self.recv.got_data.swap(true, Ordering::SeqCst) {
            debug!(transfer = %self.id, "first data received");
            self.recv.first_data.notify_one();
        }
        if self.gate_open() && matches!(self.status(), TransferStatus::New | TransferStatus::Ready) {
            self.set_status(TransferStatus::Process);
        }
    }

    async fn store_received(self: &Arc<Self>, meta: &ChunkMetadata, index: u64, compressed: Vec<u8>) {
        let expected = meta.chunk_len(index);
        let data = match tokio::task::spawn_blocking(move || decompress(&compressed, expected)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                warn!(transfer = %self.id, chunk = index, error = %e, "undecodable chunk, dropping");
                return;
            }
            Err(e) => {
                warn!(transfer = %self.id, chunk = index, error = %e, "decompression task failed");
                return;
            }
        };
        if data.len() as u64 != expected {
            warn!(
                transfer = %self.id,
                chunk = index,
                len = data.len(),
                expected,
                "chunk has wrong length, dropping"
            );
            return;
        }

        let len = data.len() as u64;
        if let Err(e) = self.cache.store_chunk(index, data).await {
            // The batch stays queued in the cache; it is retried on the next flush.
            error!(transfer = %self.id, chunk = index, error = %e, "failed to store chunk");
            return;
        }
        // Late duplicate blocks may have started a new buffer meanwhile.
        self.recv.discard(index as u32);
        trace!(transfer = %self.id, chunk = index, "chunk stored");
        self.report_progress(len);

        if self.cache.is_done() {
            self.finish_receive().await;
        }
    }

    /// Completes the receiving side once: flush, notify the sender, drain,
    /// then emit `Complete`.
    pub(crate) async fn finish_receive(self: &Arc<Self>) {
        if self.recv.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.cache.flush().await {
            error!(transfer = %self.id, error = %e, "final flush failed, will retry");
            self.recv.completed.store(false, Ordering::SeqCst);
            return;
        }
        self.recv.buffers.lock().clear();
        self.set_status(TransferStatus::Complete);
        self.send_control(&TransferMessage::Complete);
        match self.scheduler.drain(self.config.drain_timeout, &self.cancel).await {
            Ok(true) => {}
            Ok(false) => warn!(transfer = %self.id, "timed out waiting for channels to drain"),
            Err(_) => return,
        }
        info!(transfer = %self.id, "receive complete");
        self.events.emit(TransferEvent::Complete);
    }

    pub(crate) async fn on_head(self: &Arc<Self>, channel: &dyn DataChannel, meta: ChunkMetadata) {
        if meta.id != self.id {
            warn!(transfer = %self.id, head = %meta.id, "head for another transfer, ignoring");
            return;
        }
        if self.cache.meta().as_ref() != Some(&meta) {
            if let Err(e) = self.config.validate_for(&meta) {
                error!(transfer = %self.id, error = %e, "unusable head");
                return;
            }
            if let Err(e) = self.cache.set_info(meta.clone()).await {
                error!(transfer = %self.id, error = %e, "failed to store metadata");
                return;
            }
            info!(transfer = %self.id, file = %meta.file_name, size = meta.file_size, "head received");
            self.events.emit(TransferEvent::Head(meta));
        }

        if self.cache.is_done() {
            self.finish_receive().await;
        } else if !self.recv.has_data() {
            self.request_missing(Some(channel));
        }
    }

    pub(crate) fn on_remote_complete(&self) {
        if !self.cache.is_done() {
            debug!(transfer = %self.id, "sender finished but chunks are missing");
            self.recv.request_now.notify_one();
        }
    }

    /// Asks for every missing chunk, or for the head if metadata is unknown.
    fn request_missing(&self, channel: Option<&dyn DataChannel>) {
        let message = match self.cache.req_ranges() {
            None => TransferMessage::RequestHead,
            Some(ranges) if ranges.is_empty() => return,
            Some(ranges) => {
                debug!(transfer = %self.id, %ranges, "requesting content");
                TransferMessage::RequestContent { ranges }
            }
        };
        match channel {
            Some(channel) => self.send_on(channel, &message),
            None => self.send_control(&message),
        }
    }

    /// Announces readiness until data flows and re-requests missing chunks
    /// on a timer until the transfer completes.
    pub(crate) async fn request_loop(self: Arc<Self>) {
        let mut ready_tick = tokio::time::interval(self.config.ready_interval);
        ready_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_request = Instant::now() + self.config.request_interval;
        let mut shortened = false;

        loop {
            if self.status().is_terminal() {
                break;
            }
            let idle = !self.recv.has_data();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.recv.first_data.notified(), if !shortened => {
                    shortened = true;
                    next_request = next_request.min(Instant::now() + self.config.first_data_request_delay);
                }
                _ = self.recv.request_now.notified() => {
                    self.request_tick().await;
                    next_request = Instant::now() + self.config.request_interval;
                }
                _ = tokio::time::sleep_until(next_request) => {
                    if self.gate_open() {
                        self.request_tick().await;
                    }
                    next_request = Instant::now() + self.config.request_interval;
                }
                _ = ready_tick.tick(), if idle => {
                    trace!(transfer = %self.id, "announcing ready");
                    self.broadcast(&TransferMessage::Ready);
                }
            }
        }
        debug!(transfer = %self.id, "request loop stopped");
    }

    async fn request_tick(self: &Arc<Self>) {
        if self.cache.is_done() {
            self.finish_receive().await;
        } else {
            self.request_missing(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_protocol::build_packet;

    fn feed(buffer: &mut ChunkBuffer, block: u16, last: bool, payload: &[u8]) -> bool {
        let bytes = build_packet(0, block, last, payload);
        let packet = read_packet(&bytes).unwrap();
        buffer.insert(&packet)
    }

    #[test]
    fn reassembles_out_of_order_blocks() {
        let mut buffer = ChunkBuffer::default();
        assert!(feed(&mut buffer, 2, true, b"ef"));
        assert!(!buffer.is_complete());
        assert!(feed(&mut buffer, 0, false, b"ab"));
        assert!(!buffer.is_complete());
        assert!(feed(&mut buffer, 1, false, b"cd"));
        assert!(buffer.is_complete());
        assert_eq!(buffer.assemble(), b"abcdef");
    }

    #[test]
    fn duplicate_block_does_not_complete_early() {
        let mut buffer = ChunkBuffer::default();
        assert!(feed(&mut buffer, 0, false, b"ab"));
        assert!(feed(&mut buffer, 0, false, b"ab"));
        assert!(feed(&mut buffer, 2, true, b"ef"));
        assert!(!buffer.is_complete());
    }

    #[test]
    fn rejects_blocks_past_the_last() {
        let mut buffer = ChunkBuffer::default();
        assert!(feed(&mut buffer, 1, true, b"x"));
        assert!(!feed(&mut buffer, 3, false, b"y"));

        let mut other = ChunkBuffer::default();
        assert!(feed(&mut other, 4, false, b"y"));
        assert!(!feed(&mut other, 1, true, b"x"));
    }

    #[test]
    fn single_empty_block_completes() {
        let mut buffer = ChunkBuffer::default();
        assert!(feed(&mut buffer, 0, true, b""));
        assert!(buffer.is_complete());
        assert!(buffer.assemble().is_empty());
    }
}

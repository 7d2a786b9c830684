//! Sending side: chunk pipeline and send rounds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use peerdrop_chunk_cache::ChunkCache;
use peerdrop_data_channel::Payload;
use peerdrop_protocol::{ChunkRange, RangeSet, TransferMessage, split_into_packets};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::compression::compress;
use crate::transmitter::Inner;
use crate::types::{Mode, TransferEvent, TransferStatus};
use crate::TransferError;

#[derive(Default)]
pub(crate) struct SendState {
    /// Serializes send rounds.
    round: tokio::sync::Mutex<()>,
    /// Rounds started and not finished, including those waiting on `round`.
    pending_rounds: AtomicUsize,
    /// Indices requested and not yet drained.
    queued: Mutex<BTreeSet<u64>>,
    /// Indices dispatched at least once.
    sent: Mutex<BTreeSet<u64>>,
}

impl SendState {
    pub(crate) fn is_active(&self) -> bool {
        self.pending_rounds.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn sent_bytes(&self, cache: &ChunkCache) -> u64 {
        let Some(meta) = cache.meta() else {
            return 0;
        };
        self.sent.lock().iter().map(|&i| meta.chunk_len(i)).sum()
    }
}

/// One chunk, compressed and framed.
struct EncodedChunk {
    index: u64,
    raw_len: u64,
    packets: Vec<Vec<u8>>,
}

struct RoundGuard<'a>(&'a AtomicUsize);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The part of a canonical `set` below `count`.
fn clip_to(set: &RangeSet, count: u64) -> RangeSet {
    let kept = set
        .ranges()
        .iter()
        .filter(|r| r.start() < count)
        .map(|r| ChunkRange::new(r.start(), r.end().min(count - 1)))
        .collect();
    RangeSet::normalize(kept)
}

impl Inner {
    pub(crate) async fn send_ranges(self: &Arc<Self>, ranges: Option<RangeSet>) -> Result<(), TransferError> {
        if self.mode != Mode::Send {
            return Err(TransferError::WrongMode(self.mode));
        }
        let meta = self
            .cache
            .meta()
            .ok_or_else(|| TransferError::NoMetadata(self.id.clone()))?;
        let count = meta.chunk_count();
        let requested = match ranges {
            Some(ranges) => RangeSet::normalize(ranges.ranges().to_vec()),
            None => RangeSet::full(count),
        };
        let wanted = clip_to(&requested, count);
        if wanted.len() < requested.len() {
            warn!(
                transfer = %self.id,
                chunks = count,
                %requested,
                "ignoring requested chunks past the end of the file"
            );
            if wanted.is_empty() {
                return Ok(());
            }
        }

        let fresh: Vec<u64> = {
            let mut queued = self.send.queued.lock();
            wanted.iter().filter(|&i| queued.insert(i)).collect()
        };
        if fresh.is_empty() && !wanted.is_empty() {
            debug!(transfer = %self.id, requested = %wanted, "requested chunks already queued");
            return Ok(());
        }

        self.send.pending_rounds.fetch_add(1, Ordering::SeqCst);
        let _pending = RoundGuard(&self.send.pending_rounds);
        let _round = self.send.round.lock().await;
        debug!(transfer = %self.id, chunks = fresh.len(), "send round started");

        let result = self.run_round(&fresh).await;
        if result.is_ok() && !self.scheduler.drain(self.config.drain_timeout, &self.cancel).await? {
            warn!(transfer = %self.id, "timed out waiting for channels to drain");
        }
        {
            let mut queued = self.send.queued.lock();
            for index in &fresh {
                queued.remove(index);
            }
        }
        result?;

        if self.send.pending_rounds.load(Ordering::SeqCst) == 1 {
            self.send_control(&TransferMessage::Complete);
            self.set_status(TransferStatus::Complete);
            info!(transfer = %self.id, sent = self.send.sent.lock().len(), "send complete");
            self.events.emit(TransferEvent::Complete);
        }
        Ok(())
    }

    async fn run_round(self: &Arc<Self>, indices: &[u64]) -> Result<(), TransferError> {
        if indices.is_empty() {
            return Ok(());
        }
        self.wait_ready().await?;
        self.set_status(TransferStatus::Process);

        let (tx, mut rx) = mpsc::channel(self.config.pipeline_depth.max(1));
        let producer = tokio::spawn(Arc::clone(self).produce(indices.to_vec(), tx));

        let dispatched = self.dispatch(&mut rx).await;
        drop(rx);
        if dispatched.is_err() {
            producer.abort();
        }
        let produced = producer.await;
        dispatched?;
        match produced {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TransferError::Cancelled),
            Err(e) => Err(TransferError::Join(e.to_string())),
        }
    }

    /// Reads, compresses and frames chunks ahead of the dispatcher.
    async fn produce(self: Arc<Self>, indices: Vec<u64>, tx: mpsc::Sender<EncodedChunk>) -> Result<(), TransferError> {
        let level = self.config.compression_level;
        let block_size = self.config.block_size;
        for index in indices {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let raw = self
                .cache
                .get_chunk(index)
                .await?
                .ok_or(TransferError::MissingChunk(index))?;
            let raw_len = raw.len() as u64;
            let chunk_index = u32::try_from(index).map_err(|_| TransferError::MissingChunk(index))?;

            let packets = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>, TransferError> {
                let compressed = compress(&raw, level)?;
                Ok(split_into_packets(chunk_index, &compressed, block_size)?)
            })
            .await
            .map_err(|e| TransferError::Join(e.to_string()))??;

            trace!(transfer = %self.id, chunk = index, blocks = packets.len(), "chunk encoded");
            let chunk = EncodedChunk {
                index,
                raw_len,
                packets,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Sends encoded chunks in producer order, each block on the next
    /// available channel.
    async fn dispatch(&self, rx: &mut mpsc::Receiver<EncodedChunk>) -> Result<(), TransferError> {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = rx.recv() => match chunk {
                    Some(c) => c,
                    None => return Ok(()),
                },
            };

            if !self.gate_open() {
                self.wait_ready().await?;
                self.set_status(TransferStatus::Process);
            }

            for packet in chunk.packets {
                let channel = self
                    .scheduler
                    .acquire(self.config.low_water_mark, &self.cancel)
                    .await?;
                if let Err(e) = channel.send(Payload::Binary(packet)) {
                    // The block is lost; the receiver's next request covers it.
                    warn!(transfer = %self.id, label = channel.label(), error = %e, "block send failed");
                    self.scheduler.remove(channel.label());
                }
            }

            self.send.sent.lock().insert(chunk.index);
            self.report_progress(chunk.raw_len);
        }
    }
}

//! Round-robin selection among a transfer's channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use peerdrop_data_channel::{ChannelState, SharedChannel};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Upper bound between availability checks when no wake-up arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The set of channels a transmitter sends on.
#[derive(Default)]
pub struct ChannelScheduler {
    channels: RwLock<Vec<SharedChannel>>,
    cursor: AtomicUsize,
    wake: Notify,
}

impl ChannelScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: SharedChannel) {
        self.channels.write().push(channel);
        self.wake.notify_waiters();
    }

    /// Removes the channel labelled `label`; returns how many remain.
    pub fn remove(&self, label: &str) -> usize {
        let mut channels = self.channels.write();
        channels.retain(|c| c.label() != label);
        let remaining = channels.len();
        drop(channels);
        self.wake.notify_waiters();
        remaining
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channels currently open.
    pub fn open_channels(&self) -> Vec<SharedChannel> {
        self.channels
            .read()
            .iter()
            .filter(|c| c.state() == ChannelState::Open)
            .cloned()
            .collect()
    }

    /// Signals that a channel's buffered amount dropped.
    pub fn notify(&self) {
        self.wake.notify_waiters();
    }

    /// Waits for the next channel, in round-robin order, whose buffered
    /// amount is at or below `low_water`.
    pub async fn acquire(
        &self,
        low_water: usize,
        cancel: &CancellationToken,
    ) -> Result<SharedChannel, TransferError> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(channel) = self.pick(low_water)? {
                return Ok(channel);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn pick(&self, low_water: usize) -> Result<Option<SharedChannel>, TransferError> {
        let channels = self.channels.read();
        let open: Vec<&SharedChannel> = channels
            .iter()
            .filter(|c| c.state() == ChannelState::Open)
            .collect();
        if open.is_empty() {
            return Err(TransferError::NoChannels);
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..open.len() {
            let i = (start + offset) % open.len();
            if open[i].buffered_amount() <= low_water {
                self.cursor.store(i + 1, Ordering::Relaxed);
                return Ok(Some(open[i].clone()));
            }
        }
        Ok(None)
    }

    /// Waits until every open channel has flushed its buffer.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration, cancel: &CancellationToken) -> Result<bool, TransferError> {
        let wait = async {
            loop {
                let notified = self.wake.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.open_channels().iter().all(|c| c.buffered_amount() == 0) {
                    return;
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            res = tokio::time::timeout(timeout, wait) => Ok(res.is_ok()),
        }
    }
}

//! In-process channel pair.
//!
//! Each side owns an outbound queue drained by a pump task, which hands
//! messages to the other side and then releases their bytes from the
//! sender's buffered amount. Messages are delivered in order; a message
//! sent while the receiving side is not open is discarded, the way a
//! transport drops traffic for a dead peer.
//!
//! Creating a pair spawns the pump tasks, so it must run inside a Tokio
//! runtime.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use peerdrop_protocol::{EventBus, Subscription};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{ChannelEvent, ChannelState, DataChannel, DataChannelError, Payload};

/// One end of an in-memory channel pair.
#[derive(Clone)]
pub struct MemoryChannel {
    side: Arc<Side>,
}

struct Side {
    label: String,
    state: Mutex<ChannelState>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    events: EventBus<ChannelEvent>,
    outbound: mpsc::UnboundedSender<Payload>,
    peer: OnceLock<Weak<Side>>,
    drop_binary: AtomicUsize,
    /// Shared by both ends; stops both pumps.
    cancel: CancellationToken,
}

impl MemoryChannel {
    /// Creates an open pair.
    pub fn pair(label: &str) -> (Self, Self) {
        let (a, b) = Self::pending_pair(label);
        a.open();
        (a, b)
    }

    /// Creates a pair in the `Connecting` state; call [`open`](Self::open)
    /// on either end to open both.
    pub fn pending_pair(label: &str) -> (Self, Self) {
        let cancel = CancellationToken::new();
        let (a, rx_a) = Side::new(label, cancel.clone());
        let (b, rx_b) = Side::new(label, cancel.clone());
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));

        tokio::spawn(pump(Arc::downgrade(&a), rx_a, cancel.clone()));
        tokio::spawn(pump(Arc::downgrade(&b), rx_b, cancel));

        (Self { side: a }, Self { side: b })
    }

    /// Opens both ends of a pending pair. No-op once open or closed.
    pub fn open(&self) {
        self.side.mark_open();
        if let Some(peer) = self.side.peer() {
            peer.mark_open();
        }
    }

    /// Silently discards the next `count` binary messages sent from this
    /// end. Their bytes still leave the buffered amount.
    pub fn drop_next_binary(&self, count: usize) {
        self.side.drop_binary.fetch_add(count, Ordering::SeqCst);
    }
}

impl Side {
    fn new(label: &str, cancel: CancellationToken) -> (Arc<Self>, mpsc::UnboundedReceiver<Payload>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let side = Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            events: EventBus::new(),
            outbound,
            peer: OnceLock::new(),
            drop_binary: AtomicUsize::new(0),
            cancel,
        });
        (side, rx)
    }

    fn peer(&self) -> Option<Arc<Side>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn mark_open(&self) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Connecting {
                return;
            }
            *state = ChannelState::Open;
        }
        self.events.emit(ChannelEvent::Open);
    }

    fn mark_closed(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.events.emit(ChannelEvent::Closed);
        self.events.close();
    }

    fn deliver(&self, payload: Payload) {
        let len = payload.len();
        let dropped = matches!(payload, Payload::Binary(_))
            && self
                .drop_binary
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        if dropped {
            trace!(label = %self.label, len, "dropping binary message");
        } else if let Some(peer) = self.peer() {
            if *peer.state.lock() == ChannelState::Open {
                peer.events.emit(ChannelEvent::Message(payload));
            }
        }

        let prev = self.buffered.fetch_sub(len, Ordering::SeqCst);
        let now = prev - len;
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if prev > threshold && now <= threshold {
            self.events.emit(ChannelEvent::BufferedAmountLow);
        }
    }
}

async fn pump(
    side: Weak<Side>,
    mut rx: mpsc::UnboundedReceiver<Payload>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(p) => p,
                None => break,
            },
        };
        // Give the sender a chance to observe its queued bytes.
        tokio::task::yield_now().await;
        let Some(side) = side.upgrade() else { break };
        side.deliver(payload);
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.side.label
    }

    fn state(&self) -> ChannelState {
        *self.side.state.lock()
    }

    fn send(&self, payload: Payload) -> Result<(), DataChannelError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(DataChannelError::NotOpen(state));
        }
        let len = payload.len();
        self.side.buffered.fetch_add(len, Ordering::SeqCst);
        if self.side.outbound.send(payload).is_err() {
            self.side.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(DataChannelError::Closed);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.side.buffered.load(Ordering::SeqCst)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.side.low_threshold.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.side.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn subscribe(&self) -> Subscription<ChannelEvent> {
        self.side.events.subscribe()
    }

    fn close(&self) {
        self.side.cancel.cancel();
        self.side.mark_closed();
        if let Some(peer) = self.side.peer() {
            peer.mark_closed();
        }
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("label", &self.side.label)
            .field("state", &self.state())
            .field("buffered", &self.buffered_amount())
            .finish()
    }
}

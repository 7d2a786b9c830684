use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use peerdrop_chunk_cache::ChunkCache;
use peerdrop_data_channel::{ChannelEvent, DataChannel, Payload, SharedChannel, send_message};
use peerdrop_protocol::{EventBus, Progress, RangeSet, Subscription, TransferMessage};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::progress::SpeedCalculator;
use crate::receive::ReceiveState;
use crate::scheduler::ChannelScheduler;
use crate::send::SendState;
use crate::types::{Mode, TransferEvent, TransferStatus};
use crate::TransferError;

/// One side of one file transfer.
///
/// Dropping the transmitter cancels it.
pub struct FileTransmitter {
    inner: Arc<Inner>,
}

/// Whether work may proceed: the remote is known to listen and the local
/// side is not paused. Only [`FileTransmitter::resume`] lifts a local pause.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Gate {
    pub(crate) remote_ready: bool,
    pub(crate) paused: bool,
}

impl Gate {
    pub(crate) fn is_open(self) -> bool {
        self.remote_ready && !self.paused
    }
}

pub(crate) struct Inner {
    pub(crate) id: String,
    pub(crate) mode: Mode,
    pub(crate) cache: Arc<ChunkCache>,
    pub(crate) config: TransferConfig,
    pub(crate) scheduler: ChannelScheduler,
    pub(crate) status: watch::Sender<TransferStatus>,
    pub(crate) gate: watch::Sender<Gate>,
    pub(crate) events: EventBus<TransferEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) speed: SpeedCalculator,
    pub(crate) send: SendState,
    pub(crate) recv: ReceiveState,
    request_loop_started: AtomicBool,
}

impl FileTransmitter {
    /// Creates a transmitter over `cache`.
    ///
    /// A sender's cache must already carry metadata (normally an attached
    /// file). A receiver's cache may be empty; metadata then arrives with
    /// the sender's `head`.
    pub fn new(mode: Mode, cache: Arc<ChunkCache>, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        match cache.meta() {
            Some(meta) => config.validate_for(&meta)?,
            None if mode == Mode::Send => {
                return Err(TransferError::NoMetadata(cache.id().to_string()));
            }
            None => {}
        }

        let cancel = CancellationToken::new();
        let (status, _) = watch::channel(TransferStatus::New);
        // The sender waits for the receiver's `ready`; the receiver starts open.
        let (gate, _) = watch::channel(Gate {
            remote_ready: mode == Mode::Receive,
            paused: false,
        });

        let inner = Arc::new(Inner {
            id: cache.id().to_string(),
            mode,
            cache,
            config,
            scheduler: ChannelScheduler::new(),
            status,
            gate,
            events: EventBus::with_token(cancel.clone()),
            cancel,
            speed: SpeedCalculator::default(),
            send: SendState::default(),
            recv: ReceiveState::default(),
            request_loop_started: AtomicBool::new(false),
        });
        debug!(transfer = %inner.id, ?mode, "transmitter created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn status(&self) -> TransferStatus {
        *self.inner.status.borrow()
    }

    /// Watches status changes.
    pub fn status_watch(&self) -> watch::Receiver<TransferStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> Subscription<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.inner.cache
    }

    /// Attached channels, open or not.
    pub fn channel_count(&self) -> usize {
        self.inner.scheduler.len()
    }

    pub fn progress(&self) -> Progress {
        self.inner.progress()
    }

    /// Receiver: chunks with some blocks received but not yet assembled.
    pub fn partial_chunks(&self) -> usize {
        self.inner.recv.partial_chunks()
    }

    /// Adds a content channel. Must be called within a Tokio runtime.
    pub fn attach_channel(&self, channel: SharedChannel) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            warn!(transfer = %inner.id, label = channel.label(), "channel attached to cancelled transfer");
            return;
        }
        channel.set_buffered_amount_low_threshold(inner.config.low_water_mark);
        let events = channel.subscribe();
        inner.scheduler.add(Arc::clone(&channel));
        debug!(transfer = %inner.id, label = channel.label(), "channel attached");

        if inner.status() == TransferStatus::New {
            inner.set_status(TransferStatus::Ready);
        }
        tokio::spawn(Arc::clone(inner).listen(channel, events));

        if inner.mode == Mode::Receive && !inner.request_loop_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(Arc::clone(inner).request_loop());
        }
    }

    /// Sends `ranges` (all chunks when `None`), skipping chunks already
    /// queued by an earlier request. Sender only.
    ///
    /// Returns once the chunks are sent and the channels drained.
    pub async fn send_file(&self, ranges: Option<RangeSet>) -> Result<(), TransferError> {
        self.inner.send_ranges(ranges).await
    }

    /// Stops sending (or requesting) until [`resume`](Self::resume). Remote
    /// `ready` and `request-content` messages do not lift a pause.
    pub fn pause(&self) {
        let inner = &self.inner;
        inner.gate.send_modify(|g| g.paused = true);
        if inner.status() == TransferStatus::Process {
            inner.set_status(TransferStatus::Ready);
        }
        info!(transfer = %inner.id, "paused");
    }

    pub fn resume(&self) {
        let inner = &self.inner;
        inner.gate.send_replace(Gate {
            remote_ready: true,
            paused: false,
        });
        match inner.mode {
            Mode::Send => {
                if inner.send.is_active() && inner.status() == TransferStatus::Ready {
                    inner.set_status(TransferStatus::Process);
                }
            }
            Mode::Receive => inner.recv.request_now.notify_one(),
        }
        info!(transfer = %inner.id, "resumed");
    }

    /// Waits until the transfer may proceed (see [`pause`](Self::pause)).
    pub async fn wait_ready(&self) -> Result<(), TransferError> {
        self.inner.wait_ready().await
    }

    /// Aborts all pending work and ends event subscriptions. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(transfer = %self.inner.id, "transfer cancelled");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Drop for FileTransmitter {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for FileTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransmitter")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("status", &self.status())
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl Inner {
    pub(crate) fn status(&self) -> TransferStatus {
        *self.status.borrow()
    }

    /// Moves to `next`, emitting on change. `Error` is final.
    pub(crate) fn set_status(&self, next: TransferStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next || *current == TransferStatus::Error {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(transfer = %self.id, status = ?next, "status changed");
            self.events.emit(TransferEvent::StatusChanged(next));
        }
    }

    pub(crate) async fn wait_ready(&self) -> Result<(), TransferError> {
        let mut gate = self.gate.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            res = gate.wait_for(|g| g.is_open()) => res.map(|_| ()).map_err(|_| TransferError::Cancelled),
        }
    }

    pub(crate) fn gate_open(&self) -> bool {
        self.gate.borrow().is_open()
    }

    fn mark_remote_ready(&self) {
        self.gate.send_if_modified(|g| !std::mem::replace(&mut g.remote_ready, true));
    }

    pub(crate) fn progress(&self) -> Progress {
        let total = self.cache.meta().map_or(0, |m| m.file_size);
        let transferred = match self.mode {
            Mode::Send => self.send.sent_bytes(&self.cache),
            Mode::Receive => self.cache.calc_cached_bytes().unwrap_or(0),
        };
        Progress {
            total,
            transferred,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    pub(crate) fn report_progress(&self, bytes: u64) {
        self.speed.add_sample(bytes);
        self.events.emit(TransferEvent::Progress(self.progress()));
    }

    /// Sends a control message on `channel`, logging failures.
    pub(crate) fn send_on(&self, channel: &dyn DataChannel, message: &TransferMessage) {
        if let Err(e) = send_message(channel, message) {
            debug!(transfer = %self.id, label = channel.label(), kind = message.kind(), error = %e, "control send failed");
        }
    }

    /// Sends a control message on the first open channel.
    pub(crate) fn send_control(&self, message: &TransferMessage) {
        match self.scheduler.open_channels().first() {
            Some(channel) => self.send_on(channel.as_ref(), message),
            None => debug!(transfer = %self.id, kind = message.kind(), "no open channel for control message"),
        }
    }

    /// Sends a control message on every open channel.
    pub(crate) fn broadcast(&self, message: &TransferMessage) {
        for channel in self.scheduler.open_channels() {
            self.send_on(channel.as_ref(), message);
        }
    }

    async fn listen(
        self: Arc<Self>,
        channel: SharedChannel,
        mut events: Subscription<ChannelEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Message(Payload::Text(text))) => self.on_text(&channel, &text).await,
                Some(ChannelEvent::Message(Payload::Binary(bytes))) => self.on_binary(&channel, bytes).await,
                Some(ChannelEvent::BufferedAmountLow) => self.scheduler.notify(),
                Some(ChannelEvent::Open) => {
                    self.scheduler.notify();
                    if self.mode == Mode::Receive && !self.recv.has_data() {
                        self.send_on(channel.as_ref(), &TransferMessage::Ready);
                    }
                }
                Some(ChannelEvent::Error(e)) => {
                    warn!(transfer = %self.id, label = channel.label(), error = %e, "channel error");
                }
                Some(ChannelEvent::Closed) | None => break,
            }
        }
        self.channel_lost(channel.label());
    }

    fn channel_lost(&self, label: &str) {
        let remaining = self.scheduler.remove(label);
        info!(transfer = %self.id, label, remaining, "channel closed");
        if remaining == 0 && !self.status().is_terminal() {
            warn!(transfer = %self.id, "all channels closed before completion");
            self.set_status(TransferStatus::Error);
            self.events
                .emit(TransferEvent::Error("all channels closed before completion".into()));
        }
    }

    async fn on_text(self: &Arc<Self>, channel: &SharedChannel, text: &str) {
        let message = match TransferMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(transfer = %self.id, error = %e, "dropping malformed control message");
                return;
            }
        };
        debug!(transfer = %self.id, label = channel.label(), kind = message.kind(), "control message");

        match (self.mode, message) {
            (Mode::Send, TransferMessage::Ready) => {
                self.mark_remote_ready();
                self.send_head(channel.as_ref());
            }
            (Mode::Send, TransferMessage::RequestHead) => self.send_head(channel.as_ref()),
            (Mode::Send, TransferMessage::RequestContent { ranges }) => {
                self.mark_remote_ready();
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.send_ranges(Some(ranges)).await {
                        warn!(transfer = %inner.id, error = %e, "send round failed");
                    }
                });
            }
            (mode, TransferMessage::Complete) => {
                self.events.emit(TransferEvent::RemoteComplete);
                if mode == Mode::Receive {
                    self.on_remote_complete();
                }
            }
            (Mode::Receive, TransferMessage::Head(meta)) => self.on_head(channel.as_ref(), meta).await,
            (mode, message) => {
                warn!(transfer = %self.id, ?mode, kind = message.kind(), "unexpected control message");
            }
        }
    }

    fn send_head(&self, channel: &dyn DataChannel) {
        match self.cache.meta() {
            Some(meta) => self.send_on(channel, &TransferMessage::Head(meta)),
            None => warn!(transfer = %self.id, "head requested but no metadata"),
        }
    }
}

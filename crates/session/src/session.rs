use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use peerdrop_data_channel::{ChannelEvent, ChannelKind, Payload, SharedChannel, TransferLabel, send_message};
use peerdrop_protocol::constants::CONTROL_CHANNEL_LABEL;
use peerdrop_protocol::{EventBus, Subscription};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{PcEvent, PcState, PeerConnection};
use crate::negotiation::Negotiation;
use crate::signaling::{Signal, SignalingChannel};
use crate::types::{Role, SessionConfig, SessionEvent, SessionState};
use crate::SessionError;

/// A negotiated link to one remote client.
///
/// Dropping the session destroys it.
pub struct PeerSession {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) id: String,
    pub(crate) role: Role,
    pub(crate) config: SessionConfig,
    pub(crate) pc: Arc<dyn PeerConnection>,
    pub(crate) signaling: Arc<dyn SignalingChannel>,
    pub(crate) state: watch::Sender<SessionState>,
    /// Last transport state reported by the peer connection.
    pub(crate) link: watch::Sender<PcState>,
    pub(crate) events: EventBus<SessionEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) negotiation: Negotiation,
    pub(crate) reconnecting: AtomicBool,
    control: Mutex<Option<SharedChannel>>,
    destroyed: AtomicBool,
}

impl PeerSession {
    /// Wraps `pc` and starts listening to it and to `signaling`. Must be
    /// called within a Tokio runtime.
    pub fn new(
        pc: Arc<dyn PeerConnection>,
        signaling: Arc<dyn SignalingChannel>,
        role: Role,
        config: SessionConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(SessionState::Idle);
        let (link, _) = watch::channel(pc.connection_state());
        let pc_events = pc.subscribe();
        let signals = signaling.subscribe();

        let inner = Arc::new(Inner {
            id: signaling.session_id().to_string(),
            role,
            config,
            pc,
            signaling,
            state,
            link,
            events: EventBus::with_token(cancel.clone()),
            cancel,
            negotiation: Negotiation::default(),
            reconnecting: AtomicBool::new(false),
            control: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        info!(
            session = %inner.id,
            local = inner.signaling.client_id(),
            remote = inner.signaling.target_client_id(),
            ?role,
            "session created"
        );

        tokio::spawn(Arc::clone(&inner).pc_loop(pc_events));
        tokio::spawn(Arc::clone(&inner).signal_loop(signals));
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Establishes the connection. The impolite side sends the first offer;
    /// the polite side waits for it.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        if inner.link() == PcState::Connected {
            inner.set_state(SessionState::Connected);
            return Ok(());
        }
        inner.set_state(SessionState::Connecting);
        info!(session = %inner.id, role = ?inner.role, "connecting");

        if !inner.role.is_polite() {
            inner.make_offer().await?;
        }
        match inner.wait_link(inner.config.connect_timeout, true).await {
            Ok(()) => {
                inner.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "connect failed");
                inner.state.send_if_modified(|s| {
                    let reset = *s == SessionState::Connecting;
                    if reset {
                        *s = SessionState::Idle;
                    }
                    reset
                });
                Err(e)
            }
        }
    }

    /// Sends a fresh offer. Calls made while an offer is outstanding
    /// collapse into one follow-up offer.
    pub async fn renegotiate(&self) -> Result<(), SessionError> {
        self.inner.renegotiate().await
    }

    /// Restarts ICE on the existing connection and re-offers.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.inner.restart().await
    }

    /// Opens `count` content channels for `transfer_id`.
    pub fn open_transfer_channels(
        &self,
        transfer_id: &str,
        count: usize,
    ) -> Result<Vec<SharedChannel>, SessionError> {
        if self.inner.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        let channels = (0..count)
            .map(|i| {
                let label = TransferLabel::new(transfer_id, i).to_string();
                self.inner.pc.create_data_channel(&label)
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(session = %self.inner.id, transfer = transfer_id, count, "transfer channels opened");
        Ok(channels)
    }

    /// Sends an application message on the control channel.
    pub fn send_message<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), SessionError> {
        let channel = self
            .inner
            .control
            .lock()
            .clone()
            .ok_or(SessionError::NoControlChannel)?;
        send_message(channel.as_ref(), message)?;
        Ok(())
    }

    /// The control channel, once one exists.
    pub fn control_channel(&self) -> Option<SharedChannel> {
        self.inner.control.lock().clone()
    }

    /// Cancels all listeners, closes the connection and emits `Close`.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn link(&self) -> PcState {
        *self.link.borrow()
    }

    pub(crate) fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to `next`, emitting on change. `Closed` is final.
    pub(crate) fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next || current.is_closed() {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(session = %self.id, state = ?next, "state changed");
            self.events.emit(SessionEvent::StateChanged(next));
        }
    }

    /// Waits until the link is connected.
    ///
    /// A failed or closed link ends the wait with an error, as does a
    /// disconnected one when `fail_on_disconnect` is set.
    pub(crate) async fn wait_link(&self, timeout: Duration, fail_on_disconnect: bool) -> Result<(), SessionError> {
        let mut link = self.link.subscribe();
        let settled = |s: &PcState| match s {
            PcState::Connected | PcState::Failed | PcState::Closed => true,
            PcState::Disconnected => fail_on_disconnect,
            PcState::New | PcState::Connecting => false,
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Destroyed),
            res = tokio::time::timeout(timeout, link.wait_for(settled)) => match res {
                Err(_) => return Err(SessionError::Timeout),
                Ok(Err(_)) => return Err(SessionError::Destroyed),
                Ok(Ok(state)) => *state,
            },
        };
        match result {
            PcState::Connected => Ok(()),
            other => Err(SessionError::ConnectFailed(other)),
        }
    }

    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.id, "session destroyed");
        self.set_state(SessionState::Closed);
        self.events.emit(SessionEvent::Close);
        self.cancel.cancel();
        if let Some(control) = self.control.lock().take() {
            control.close();
        }
        self.pc.close();
    }

    async fn pc_loop(self: Arc<Self>, mut events: Subscription<PcEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };
            match event {
                PcEvent::ConnectionState(state) => self.on_link_state(state),
                PcEvent::IceCandidate(candidate) => {
                    if let Err(e) = self.signaling.send(Signal::Candidate(candidate)).await {
                        warn!(session = %self.id, error = %e, "failed to relay candidate");
                    }
                }
                PcEvent::NegotiationNeeded => {
                    if let Err(e) = self.renegotiate().await {
                        warn!(session = %self.id, error = %e, "renegotiation failed");
                    }
                }
                PcEvent::DataChannel(channel) => self.on_data_channel(channel),
            }
        }
        trace!(session = %self.id, "peer connection listener stopped");
    }

    fn on_link_state(self: &Arc<Self>, state: PcState) {
        self.link.send_replace(state);
        debug!(session = %self.id, ?state, "link state");
        match state {
            PcState::Connected => {
                if !self.session_state().is_closed() {
                    self.set_state(SessionState::Connected);
                }
                if !self.role.is_polite() && self.control.lock().is_none() {
                    self.open_control();
                }
            }
            PcState::Disconnected | PcState::Failed => {
                let was_up = matches!(
                    self.session_state(),
                    SessionState::Connected | SessionState::Reconnecting { .. }
                );
                if was_up && self.config.auto_reconnect {
                    self.spawn_reconnect();
                } else if was_up {
                    warn!(session = %self.id, ?state, "link lost, reconnection disabled");
                }
            }
            PcState::Closed => {
                if !self.is_destroyed() {
                    warn!(session = %self.id, "peer connection closed underneath the session");
                    self.destroy();
                }
            }
            PcState::New | PcState::Connecting => {}
        }
    }

    fn open_control(self: &Arc<Self>) {
        match self.pc.create_data_channel(CONTROL_CHANNEL_LABEL) {
            Ok(channel) => {
                debug!(session = %self.id, "control channel opened");
                self.attach_control(channel);
            }
            Err(e) => warn!(session = %self.id, error = %e, "failed to open control channel"),
        }
    }

    fn on_data_channel(self: &Arc<Self>, channel: SharedChannel) {
        match ChannelKind::classify(channel.label()) {
            ChannelKind::Control => {
                debug!(session = %self.id, "remote opened control channel");
                self.attach_control(channel);
            }
            ChannelKind::Transfer(label) => {
                debug!(session = %self.id, label = channel.label(), "remote opened transfer channel");
                self.events.emit(SessionEvent::TransferChannel {
                    transfer_id: label.transfer_id,
                    channel,
                });
            }
            ChannelKind::Other(label) => {
                warn!(session = %self.id, %label, "ignoring channel with unknown label");
            }
        }
    }

    fn attach_control(self: &Arc<Self>, channel: SharedChannel) {
        let events = channel.subscribe();
        *self.control.lock() = Some(Arc::clone(&channel));
        tokio::spawn(Arc::clone(self).control_loop(channel, events));
    }

    async fn control_loop(self: Arc<Self>, channel: SharedChannel, mut events: Subscription<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Message(Payload::Text(text))) => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => self.events.emit(SessionEvent::Message(value)),
                        Err(e) => warn!(session = %self.id, error = %e, "dropping malformed control message"),
                    }
                }
                Some(ChannelEvent::Message(Payload::Binary(bytes))) => {
                    warn!(session = %self.id, len = bytes.len(), "dropping binary message on control channel");
                }
                Some(ChannelEvent::Error(e)) => warn!(session = %self.id, error = %e, "control channel error"),
                Some(ChannelEvent::Open | ChannelEvent::BufferedAmountLow) => {}
                Some(ChannelEvent::Closed) | None => break,
            }
        }
        let mut control = self.control.lock();
        if control.as_ref().is_some_and(|c| Arc::ptr_eq(c, &channel)) {
            *control = None;
        }
        debug!(session = %self.id, "control channel closed");
    }

    async fn signal_loop(self: Arc<Self>, mut signals: Subscription<Signal>) {
        loop {
            let signal = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(s) => s,
                    None => break,
                },
            };
            let kind = signal.kind();
            if let Err(e) = self.handle_signal(signal).await {
                warn!(session = %self.id, kind, error = %e, "failed to apply signal");
            }
        }
        trace!(session = %self.id, "signal listener stopped");
    }
}

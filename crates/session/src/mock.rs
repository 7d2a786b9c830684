//! In-process peer connections and signaling.
//!
//! [`MockPeerConnection::pair`] models the parts of a WebRTC connection a
//! session relies on: the signaling state machine with rollback, ICE
//! candidates that need a remote description, a connection that comes up
//! when an offer/answer exchange completes, and data channels backed by
//! [`MemoryChannel`]. Used by tests and by the CLI's loopback mode.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures_util::future::{self, BoxFuture};
use parking_lot::Mutex;
use peerdrop_data_channel::{DataChannel, MemoryChannel, SharedChannel};
use peerdrop_protocol::{EventBus, Subscription};
use tracing::trace;

use crate::connection::{
    IceCandidate, PcEvent, PcState, PeerConnection, SdpType, SessionDescription, SignalingState,
};
use crate::signaling::{Signal, SignalingChannel};
use crate::{ConnectionError, SignalingError};

/// One end of an in-process peer connection.
#[derive(Clone)]
pub struct MockPeerConnection {
    inner: Arc<MockInner>,
}

struct MockInner {
    name: String,
    state: Mutex<MockState>,
    events: EventBus<PcEvent>,
    peer: OnceLock<Weak<MockInner>>,
    answers: AtomicUsize,
    rollbacks: AtomicUsize,
}

struct MockState {
    signaling: SignalingState,
    link: PcState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ice_generation: u32,
    descriptions: u64,
    remote_candidates: Vec<IceCandidate>,
    /// Channels created before the link came up, with their remote ends.
    pending: Vec<(MemoryChannel, MemoryChannel)>,
    channels: Vec<MemoryChannel>,
}

impl MockPeerConnection {
    /// Creates two connected-to-each-other ends, both `New`.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(MockInner::new("a"));
        let b = Arc::new(MockInner::new("b"));
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (Self { inner: a }, Self { inner: b })
    }

    /// Drops the link on both ends, as a transient network failure would.
    pub fn simulate_disconnect(&self) {
        self.inner.set_link(PcState::Disconnected);
        if let Some(peer) = self.inner.peer() {
            peer.set_link(PcState::Disconnected);
        }
    }

    /// Raises `NegotiationNeeded`, as adding a track would.
    pub fn trigger_negotiation_needed(&self) {
        self.inner.events.emit(PcEvent::NegotiationNeeded);
    }

    /// Answers this end has applied locally.
    pub fn answers_created(&self) -> usize {
        self.inner.answers.load(Ordering::SeqCst)
    }

    /// Local offers rolled back.
    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.state.lock().remote_candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().remote.clone()
    }
}

impl MockInner {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                link: PcState::New,
                local: None,
                remote: None,
                ice_generation: 0,
                descriptions: 0,
                remote_candidates: Vec::new(),
                pending: Vec::new(),
                channels: Vec::new(),
            }),
            events: EventBus::new(),
            peer: OnceLock::new(),
            answers: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    fn peer(&self) -> Option<Arc<MockInner>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn set_link(&self, link: PcState) {
        {
            let mut state = self.state.lock();
            if state.link == link || state.link == PcState::Closed {
                return;
            }
            state.link = link;
        }
        trace!(pc = %self.name, ?link, "link state");
        self.events.emit(PcEvent::ConnectionState(link));
    }

    /// Brings both ends up and hands over channels created meanwhile.
    fn establish(&self) {
        let Some(peer) = self.peer() else { return };
        self.set_link(PcState::Connected);
        peer.set_link(PcState::Connected);
        self.flush_pending(&peer);
        peer.flush_pending(self);
    }

    fn flush_pending(&self, peer: &MockInner) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for (local, remote) in pending {
            local.open();
            peer.events.emit(PcEvent::DataChannel(Arc::new(remote)));
        }
    }

    fn check_open(&self, state: &MockState) -> Result<(), ConnectionError> {
        if state.link == PcState::Closed {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe(&self, kind: SdpType) -> Result<SessionDescription, ConnectionError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if kind == SdpType::Answer && state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ConnectionError::InvalidState {
                op: "create answer",
                state: state.signaling,
            });
        }
        state.descriptions += 1;
        let sdp = format!(
            "v=0 o={} {} ice={}",
            self.name, state.descriptions, state.ice_generation
        );
        Ok(SessionDescription { kind, sdp })
    }

    fn candidate(&self, state: &MockState) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} {} udp host", self.name, state.ice_generation),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn set_local(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let mut emit = Vec::new();
        {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            let invalid = |state: &MockState| ConnectionError::InvalidState {
                op: "set local description",
                state: state.signaling,
            };
            match desc.kind {
                SdpType::Offer => {
                    if state.signaling == SignalingState::HaveRemoteOffer {
                        return Err(invalid(&*state));
                    }
                    state.signaling = SignalingState::HaveLocalOffer;
                    emit.push(PcEvent::IceCandidate(self.candidate(&state)));
                    state.local = Some(desc);
                }
                SdpType::Answer => {
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(invalid(&*state));
                    }
                    state.signaling = SignalingState::Stable;
                    self.answers.fetch_add(1, Ordering::SeqCst);
                    if state.link != PcState::Connected {
                        state.link = PcState::Connecting;
                        emit.push(PcEvent::ConnectionState(PcState::Connecting));
                    }
                    emit.push(PcEvent::IceCandidate(self.candidate(&state)));
                    state.local = Some(desc);
                }
                SdpType::Rollback => {
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(invalid(&*state));
                    }
                    state.signaling = SignalingState::Stable;
                    state.local = None;
                    self.rollbacks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        for event in emit {
            self.events.emit(event);
        }
        Ok(())
    }

    fn set_remote(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let established = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            let invalid = |state: &MockState| ConnectionError::InvalidState {
                op: "set remote description",
                state: state.signaling,
            };
            match desc.kind {
                SdpType::Offer => {
                    if state.signaling != SignalingState::Stable {
                        return Err(invalid(&*state));
                    }
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(desc);
                    false
                }
                SdpType::Answer => {
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(invalid(&*state));
                    }
                    state.signaling = SignalingState::Stable;
                    state.remote = Some(desc);
                    true
                }
                SdpType::Rollback => return Err(invalid(&*state)),
            }
        };
        if established {
            self.establish();
        }
        Ok(())
    }

    fn add_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if state.remote.is_none() {
            return Err(ConnectionError::NoRemoteDescription);
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn create_channel(&self, label: &str) -> Result<SharedChannel, ConnectionError> {
        let (local, remote) = MemoryChannel::pending_pair(label);
        let deliver = {
            let mut state = self.state.lock();
            self.check_open(&state)?;
            state.channels.push(local.clone());
            if state.link == PcState::Connected {
                true
            } else {
                state.pending.push((local.clone(), remote.clone()));
                false
            }
        };
        if deliver {
            match self.peer() {
                Some(peer) => {
                    local.open();
                    peer.events.emit(PcEvent::DataChannel(Arc::new(remote)));
                }
                None => local.close(),
            }
        }
        Ok(Arc::new(local))
    }

    fn close(&self) {
        let channels = {
            let mut state = self.state.lock();
            if state.link == PcState::Closed {
                return;
            }
            state.link = PcState::Closed;
            state.signaling = SignalingState::Closed;
            state.pending.clear();
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close();
        }
        trace!(pc = %self.name, "closed");
        self.events.emit(PcEvent::ConnectionState(PcState::Closed));
        self.events.close();
    }
}

impl PeerConnection for MockPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.inner.state.lock().signaling
    }

    fn connection_state(&self) -> PcState {
        self.inner.state.lock().link
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, ConnectionError>> {
        Box::pin(future::ready(self.inner.describe(SdpType::Offer)))
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, ConnectionError>> {
        Box::pin(future::ready(self.inner.describe(SdpType::Answer)))
    }

    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(future::ready(self.inner.set_local(desc)))
    }

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(future::ready(self.inner.set_remote(desc)))
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), ConnectionError>> {
        Box::pin(future::ready(self.inner.add_candidate(candidate)))
    }

    fn restart_ice(&self) {
        self.inner.state.lock().ice_generation += 1;
    }

    fn create_data_channel(&self, label: &str) -> Result<SharedChannel, ConnectionError> {
        self.inner.create_channel(label)
    }

    fn subscribe(&self) -> Subscription<PcEvent> {
        self.inner.events.subscribe()
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// One end of an in-process signaling relay.
pub struct LoopbackSignaling {
    session_id: String,
    client_id: String,
    target_client_id: String,
    inbox: Arc<EventBus<Signal>>,
    outbox: Arc<EventBus<Signal>>,
    sent: Mutex<Vec<Signal>>,
    offline: AtomicBool,
}

impl LoopbackSignaling {
    /// Creates a relay between `a` and `b` under a fresh session id.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let to_a = Arc::new(EventBus::new());
        let to_b = Arc::new(EventBus::new());
        let end = |client: &str, target: &str, inbox: &Arc<EventBus<Signal>>, outbox: &Arc<EventBus<Signal>>| Self {
            session_id: session_id.clone(),
            client_id: client.to_string(),
            target_client_id: target.to_string(),
            inbox: Arc::clone(inbox),
            outbox: Arc::clone(outbox),
            sent: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        };
        (end(a, b, &to_a, &to_b), end(b, a, &to_b, &to_a))
    }

    /// Every signal sent from this end, in order.
    pub fn sent(&self) -> Vec<Signal> {
        self.sent.lock().clone()
    }

    /// How many signals of `kind` ("offer", "answer", "candidate") were sent.
    pub fn sent_count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|s| s.kind() == kind).count()
    }

    /// Makes sends from this end fail until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl SignalingChannel for LoopbackSignaling {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn target_client_id(&self) -> &str {
        &self.target_client_id
    }

    fn send(&self, signal: Signal) -> BoxFuture<'_, Result<(), SignalingError>> {
        let result = if self.offline.load(Ordering::SeqCst) {
            Err(SignalingError::Transport(format!("{} is offline", self.client_id)))
        } else {
            trace!(from = %self.client_id, kind = signal.kind(), "signal");
            self.sent.lock().push(signal.clone());
            self.outbox.emit(signal);
            Ok(())
        };
        Box::pin(future::ready(result))
    }

    fn subscribe(&self) -> Subscription<Signal> {
        self.inbox.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_data_channel::ChannelState;

    #[tokio::test]
    async fn offer_answer_connects_both_ends() {
        let (a, b) = MockPeerConnection::pair();
        let mut b_events = b.subscribe();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.connection_state(), PcState::Connected);
        assert_eq!(b.connection_state(), PcState::Connected);
        assert_eq!(b.answers_created(), 1);

        let mut saw_connected = false;
        while let Some(event) = b_events.try_recv() {
            if matches!(event, PcEvent::ConnectionState(PcState::Connected)) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn remote_offer_needs_rollback_first() {
        let (a, b) = MockPeerConnection::pair();
        let mine = a.create_offer().await.unwrap();
        a.set_local_description(mine).await.unwrap();
        let theirs = b.create_offer().await.unwrap();

        assert!(matches!(
            a.set_remote_description(theirs.clone()).await,
            Err(ConnectionError::InvalidState { .. })
        ));
        a.set_local_description(SessionDescription::rollback()).await.unwrap();
        a.set_remote_description(theirs).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(a.rollbacks(), 1);
    }

    #[tokio::test]
    async fn candidate_without_remote_description_fails() {
        let (a, _b) = MockPeerConnection::pair();
        let candidate = IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(matches!(
            a.add_ice_candidate(candidate).await,
            Err(ConnectionError::NoRemoteDescription)
        ));
    }

    #[tokio::test]
    async fn early_channel_opens_on_connect() {
        let (a, b) = MockPeerConnection::pair();
        let mut b_events = b.subscribe();
        let channel = a.create_data_channel("message").unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(channel.state(), ChannelState::Open);
        let mut remote = None;
        while let Some(event) = b_events.try_recv() {
            if let PcEvent::DataChannel(c) = event {
                remote = Some(c);
            }
        }
        let remote = remote.expect("remote end delivered");
        assert_eq!(remote.label(), "message");
        assert_eq!(remote.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn loopback_records_and_delivers() {
        let (a, b) = LoopbackSignaling::pair("alice", "bob");
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(a.target_client_id(), "bob");
        let mut inbox = b.subscribe();

        a.send(Signal::Offer("sdp".into())).await.unwrap();
        assert_eq!(inbox.recv().await, Some(Signal::Offer("sdp".into())));
        assert_eq!(a.sent_count("offer"), 1);

        a.set_offline(true);
        assert!(a.send(Signal::Answer("x".into())).await.is_err());
        assert_eq!(a.sent().len(), 1);
    }
}

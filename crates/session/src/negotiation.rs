//! Perfect negotiation.
//!
//! Both peers may offer whenever they like. When offers cross, the polite
//! peer rolls its own back and answers the remote one; the impolite peer
//! ignores the remote offer and waits for the answer to its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::connection::{SessionDescription, SignalingState};
use crate::session::Inner;
use crate::signaling::Signal;
use crate::SessionError;

#[derive(Default)]
pub(crate) struct Negotiation {
    /// Between `create_offer` and sending the offer.
    making_offer: AtomicBool,
    /// The last remote offer was ignored; its candidates may fail.
    ignore_offer: AtomicBool,
    /// A `renegotiate` call is running.
    in_flight: AtomicBool,
    /// A renegotiation was requested while an offer was outstanding.
    pending: AtomicBool,
}

/// Clears a flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    /// Creates an offer, applies it locally and sends it.
    pub(crate) async fn make_offer(&self) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        let negotiation = &self.negotiation;
        negotiation.making_offer.store(true, Ordering::SeqCst);
        let _making = FlagGuard(&negotiation.making_offer);

        let offer = self.pc.create_offer().await?;
        let state = self.pc.signaling_state();
        if state != SignalingState::Stable {
            // A remote offer was accepted meanwhile.
            debug!(session = %self.id, ?state, "dropping stale local offer");
            return Ok(());
        }
        self.pc.set_local_description(offer.clone()).await?;
        self.signaling.send(Signal::Offer(offer.sdp)).await?;
        debug!(session = %self.id, "offer sent");
        Ok(())
    }

    pub(crate) async fn renegotiate(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        let negotiation = &self.negotiation;
        if negotiation.in_flight.swap(true, Ordering::SeqCst) {
            negotiation.pending.store(true, Ordering::SeqCst);
            debug!(session = %self.id, "renegotiation already running, collapsing");
            return Ok(());
        }
        let _running = FlagGuard(&negotiation.in_flight);

        if self.pc.signaling_state() != SignalingState::Stable {
            negotiation.pending.store(true, Ordering::SeqCst);
            debug!(session = %self.id, "offer outstanding, deferring renegotiation");
            return Ok(());
        }
        negotiation.pending.store(false, Ordering::SeqCst);
        self.make_offer().await
    }

    /// Restarts ICE and re-offers, discarding an unanswered offer first.
    pub(crate) async fn restart(&self) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        if self.pc.signaling_state() == SignalingState::HaveLocalOffer {
            self.pc.set_local_description(SessionDescription::rollback()).await?;
        }
        self.pc.restart_ice();
        info!(session = %self.id, "ICE restart");
        self.make_offer().await
    }

    /// Runs a deferred renegotiation once signaling is stable again.
    fn flush_pending(self: &Arc<Self>) {
        if self.pc.signaling_state() == SignalingState::Stable
            && self.negotiation.pending.swap(false, Ordering::SeqCst)
        {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = inner.renegotiate().await {
                    warn!(session = %inner.id, error = %e, "deferred renegotiation failed");
                }
            });
        }
    }

    pub(crate) async fn handle_signal(self: &Arc<Self>, signal: Signal) -> Result<(), SessionError> {
        let negotiation = &self.negotiation;
        match signal {
            Signal::Offer(sdp) => {
                let state = self.pc.signaling_state();
                let collision =
                    negotiation.making_offer.load(Ordering::SeqCst) || state != SignalingState::Stable;
                let ignore = collision && !self.role.is_polite();
                negotiation.ignore_offer.store(ignore, Ordering::SeqCst);
                if ignore {
                    debug!(session = %self.id, "ignoring colliding offer");
                    return Ok(());
                }
                if state == SignalingState::HaveLocalOffer {
                    info!(session = %self.id, "offer collision, rolling back local offer");
                    self.pc.set_local_description(SessionDescription::rollback()).await?;
                }
                self.pc.set_remote_description(SessionDescription::offer(sdp)).await?;
                let answer = self.pc.create_answer().await?;
                self.pc.set_local_description(answer.clone()).await?;
                self.signaling.send(Signal::Answer(answer.sdp)).await?;
                debug!(session = %self.id, "answer sent");
                self.flush_pending();
            }
            Signal::Answer(sdp) => {
                let state = self.pc.signaling_state();
                if state != SignalingState::HaveLocalOffer {
                    warn!(session = %self.id, ?state, "dropping unexpected answer");
                    return Ok(());
                }
                self.pc.set_remote_description(SessionDescription::answer(sdp)).await?;
                debug!(session = %self.id, "answer applied");
                self.flush_pending();
            }
            Signal::Candidate(candidate) => {
                if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                    if negotiation.ignore_offer.load(Ordering::SeqCst) {
                        debug!(session = %self.id, error = %e, "candidate for ignored offer dropped");
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

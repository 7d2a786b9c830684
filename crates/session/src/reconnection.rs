//! Automatic reconnection with exponential backoff.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use crate::connection::PcState;
use crate::session::Inner;
use crate::types::{SessionEvent, SessionState};
use crate::SessionError;

impl Inner {
    /// Starts the reconnect loop unless one is already running.
    pub(crate) fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).reconnect_loop());
    }

    /// Retries until the link is back or attempts run out.
    ///
    /// Only the impolite side restarts ICE and offers; the polite side
    /// waits for that offer.
    async fn reconnect_loop(self: Arc<Self>) {
        let config = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        let recovered = loop {
            if self.link() == PcState::Connected {
                break true;
            }
            let Some(delay) = config.next_delay(attempt + 1) else {
                break false;
            };
            attempt += 1;
            self.set_state(SessionState::Reconnecting { attempt });

            let delay_secs = delay.as_secs_f64();
            info!(
                session = %self.id,
                attempt,
                delay_secs = format_args!("{delay_secs:.2}"),
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(session = %self.id, "reconnect cancelled");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.link() != PcState::Connected && !self.role.is_polite() {
                if let Err(e) = self.restart().await {
                    warn!(session = %self.id, attempt, error = %e, "restart failed");
                }
            }
            match self.wait_link(self.config.connect_timeout, false).await {
                Ok(()) => break true,
                Err(SessionError::Destroyed) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => debug!(session = %self.id, attempt, error = %e, "reconnect attempt failed"),
            }
        };
        self.reconnecting.store(false, Ordering::SeqCst);

        if recovered {
            info!(session = %self.id, attempt, "reconnected");
            self.set_state(SessionState::Connected);
        } else {
            error!(session = %self.id, attempts = attempt, "reconnect attempts exhausted");
            self.events.emit(SessionEvent::Error(format!(
                "reconnect failed after {attempt} attempts"
            )));
            self.destroy();
        }
    }
}

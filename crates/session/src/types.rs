//! Public types for peer sessions.

use std::fmt;
use std::time::Duration;

use peerdrop_data_channel::SharedChannel;
use rand::Rng;

/// Which side yields when both peers offer at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rolls back its own offer and accepts the remote one.
    Polite,
    /// Ignores a colliding remote offer.
    Impolite,
}

impl Role {
    /// The side created later is polite. Equal timestamps fall back to the
    /// client ids; the greater id is polite.
    pub fn from_timestamps(local_ts: u64, remote_ts: u64, local_id: &str, remote_id: &str) -> Self {
        let polite = match local_ts.cmp(&remote_ts) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => local_id > remote_id,
        };
        if polite { Self::Polite } else { Self::Impolite }
    }

    pub fn is_polite(self) -> bool {
        self == Self::Polite
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Connection lost, attempting to reconnect.
    Reconnecting { attempt: u32 },
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Events emitted by a session.
#[derive(Clone)]
pub enum SessionEvent {
    /// An application message from the control channel.
    Message(serde_json::Value),
    /// The remote opened a content channel for `transfer_id`.
    TransferChannel {
        transfer_id: String,
        channel: SharedChannel,
    },
    StateChanged(SessionState),
    /// Fatal; the session is destroyed right after.
    Error(String),
    /// Emitted once, on destroy.
    Close,
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(v) => f.debug_tuple("Message").field(v).finish(),
            Self::TransferChannel {
                transfer_id,
                channel,
            } => f
                .debug_struct("TransferChannel")
                .field("transfer_id", transfer_id)
                .field("label", &channel.label())
                .finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// How a session retries after losing its link.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first attempt.
    pub initial_delay: Duration,
    /// Ceiling for the grown delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Attempts before the session gives up and is destroyed.
    pub max_attempts: u32,
    /// Fraction of each delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 8,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered wait before `attempt` (counted from 1), or `None` when
    /// the attempt is past `max_attempts`.
    pub fn base_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exponent);
        let capped = grown.min(self.max_delay.as_secs_f64());
        Some(Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay))
    }

    /// [`base_delay`](Self::base_delay) moved randomly by up to `jitter`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let base = self.base_delay(attempt)?;
        Some(spread(base, self.jitter, random_unit()))
    }
}

/// Scales `base` by `1 + jitter * unit` for `unit` in `[-1, 1]`. Never
/// returns less than a millisecond.
fn spread(base: Duration, jitter: f64, unit: f64) -> Duration {
    let factor = 1.0 + jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
        .unwrap_or(base)
        .max(Duration::from_millis(1))
}

fn random_unit() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `connect` and each reconnect attempt wait for the link.
    pub connect_timeout: Duration,
    /// Reconnect automatically after a transient disconnect.
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

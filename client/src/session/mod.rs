//! Chat session management over the service WebSocket.

pub(crate) mod manager;
mod socket;

pub use manager::{SessionLink, SessionManager};
pub use socket::{ChatSocket, SocketConnector, TungsteniteConnector};

use rand::Rng;
use std::time::Duration;

/// Coarse connection state exposed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Fine-grained internal state of the session runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    RetrievingToken,
    TokenRetrieved,
    CreatingSession,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub(crate) fn connection_state(self) -> ConnectionState {
        match self {
            SessionState::Idle => ConnectionState::Idle,
            SessionState::RetrievingToken
            | SessionState::TokenRetrieved
            | SessionState::CreatingSession => ConnectionState::Connecting,
            SessionState::Connected => ConnectionState::Connected,
            SessionState::Disconnecting => ConnectionState::Disconnecting,
        }
    }
}

/// Errors surfaced on the session diagnostics stream. Consuming the
/// stream is optional; the runtime recovers on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("token retrieval failed: {0}")]
    Token(String),
    #[error("socket transport error: {0}")]
    Transport(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { attempts: u32 },
}

/// Backoff policy for re-establishing the socket after a transport
/// failure. Attempts past `max_attempts` park the session in idle
/// until the next explicit open request.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), with up to 25% random
    /// jitter so clients do not reconnect in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(-0.25..0.25);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

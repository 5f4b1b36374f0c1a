//! Session state
//!
//! The single session owned by a [`SessionController`](crate::SessionController)
//! and the read-only snapshot it publishes to callers.

use crate::directory::Server;
use crate::monitor::Severity;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

/// Session lifecycle state
///
/// ```text
/// Disconnected ─▶ Connecting ─▶ Connected ─▶ Disconnecting ─▶ Disconnected
///                     │                           ▲
///                     ├───────────────────────────┘ (cancel)
///                     ▼
///                   Failed ─▶ Disconnected (acknowledge)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed)
    }

    /// Settled states are the only ones a third party may observe between
    /// transitions
    pub fn is_settled(&self) -> bool {
        !matches!(self, SessionState::Disconnecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The session record
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub state: SessionState,
    pub server: Option<Server>,
    /// Present only while connected
    pub virtual_address: Option<Ipv4Addr>,
    /// Informational, from an external lookup
    pub public_address: Option<IpAddr>,
    pub created_at: Instant,
    pub last_transition_at: Instant,
    pub connected_at: Option<Instant>,
    pub last_threat: Severity,
    /// False while the threat feed is lost
    pub threat_feed_available: bool,
    /// Why the session last failed
    pub failure: Option<String>,
}

impl Session {
    pub fn new(now: Instant) -> Self {
        Self {
            state: SessionState::Disconnected,
            server: None,
            virtual_address: None,
            public_address: None,
            created_at: now,
            last_transition_at: now,
            connected_at: None,
            last_threat: Severity::None,
            threat_feed_available: true,
            failure: None,
        }
    }

    pub fn snapshot(&self, layer_depth: usize, now: Instant) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            server: self.server.clone(),
            virtual_address: self.virtual_address,
            public_address: self.public_address,
            layer_depth,
            last_threat: self.last_threat,
            threat_feed_available: self.threat_feed_available,
            failure: self.failure.clone(),
            session_age: now.saturating_duration_since(self.created_at),
            in_state_for: now.saturating_duration_since(self.last_transition_at),
            connected_for: self.connected_at.map(|t| now.saturating_duration_since(t)),
        }
    }
}

/// Point-in-time view of the session for presentation layers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Selected server
    pub server: Option<Server>,
    pub virtual_address: Option<Ipv4Addr>,
    pub public_address: Option<IpAddr>,
    /// Active encryption layers
    pub layer_depth: usize,
    pub last_threat: Severity,
    pub threat_feed_available: bool,
    pub failure: Option<String>,
    pub session_age: Duration,
    pub in_state_for: Duration,
    pub connected_for: Option<Duration>,
}

impl SessionSnapshot {
    /// One-line status for logs
    pub fn summary(&self) -> String {
        let server = self
            .server
            .as_ref()
            .map(|s| format!("{} ({})", s.name, s.location))
            .unwrap_or_else(|| "-".to_string());
        let address = self
            .virtual_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());

        format!(
            "Session: {} | Server: {} | Address: {} | Layers: {} | Threat: {}",
            self.state, server, address, self.layer_depth, self.last_threat
        )
    }
}

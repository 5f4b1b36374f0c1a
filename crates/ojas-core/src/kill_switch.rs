//! Kill Switch
//!
//! Blocks tunnel-bound traffic whenever the session is not connected, so
//! nothing leaks out over the real interface while a session is coming
//! up, failing, or tearing down.
//!
//! The switch only tracks state. The data path asks [`KillSwitch::check`]
//! before forwarding; the session controller flips it on every entry to
//! and exit from `Connected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// Switch turned off by the user
    Disabled,
    /// Switch on, session connected: traffic flows
    Armed,
    /// Switch on, session down: traffic blocked
    Blocking,
}

impl KillSwitchState {
    pub fn allows_traffic(&self) -> bool {
        !self.is_blocking()
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Blocking)
    }
}

/// Cloneable kill switch handle
#[derive(Debug, Clone)]
pub struct KillSwitch {
    enabled: Arc<AtomicBool>,
    session_up: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
            session_up: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> KillSwitchState {
        if !self.enabled.load(Ordering::Acquire) {
            KillSwitchState::Disabled
        } else if self.session_up.load(Ordering::Acquire) {
            KillSwitchState::Armed
        } else {
            KillSwitchState::Blocking
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_blocking(&self) -> bool {
        self.state().is_blocking()
    }

    /// Turn the switch on or off (user setting)
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!("Kill switch {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Session reached `Connected`
    pub fn on_session_up(&self) {
        debug!("Kill switch: session up, traffic allowed");
        self.session_up.store(true, Ordering::Release);
    }

    /// Session left `Connected`
    pub fn on_session_down(&self) {
        let was_up = self.session_up.swap(false, Ordering::AcqRel);
        if was_up && self.is_enabled() {
            warn!("Kill switch: session down, blocking traffic");
        }
    }

    /// Gate for the data path
    pub fn check(&self) -> Result<(), KillSwitchError> {
        if self.is_blocking() {
            Err(KillSwitchError::TrafficBlocked)
        } else {
            Ok(())
        }
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Kill switch error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillSwitchError {
    #[error("Traffic blocked: session is down (kill switch active)")]
    TrafficBlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_allows_traffic() {
        let ks = KillSwitch::new(false);

        assert_eq!(ks.state(), KillSwitchState::Disabled);
        assert!(ks.check().is_ok());
    }

    #[test]
    fn test_blocks_until_session_up() {
        let ks = KillSwitch::default();

        assert_eq!(ks.state(), KillSwitchState::Blocking);
        assert_eq!(ks.check(), Err(KillSwitchError::TrafficBlocked));

        ks.on_session_up();
        assert_eq!(ks.state(), KillSwitchState::Armed);
        assert!(ks.check().is_ok());

        ks.on_session_down();
        assert!(ks.is_blocking());
    }

    #[test]
    fn test_toggle_shared_across_clones() {
        let ks = KillSwitch::new(true);
        let data_path = ks.clone();

        ks.set_enabled(false);
        assert!(data_path.state().allows_traffic());

        ks.set_enabled(true);
        assert!(data_path.is_blocking());
    }
}

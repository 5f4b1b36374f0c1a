//! OJAS Encryption Layer Stack
//!
//! Ordered stack of encryption layers wrapped around tunnel traffic.
//! Layer 1 is innermost. The stack only records which layers are active
//! and when each was added; it holds no timers and makes no policy
//! decisions. Pacing and escalation policy belong to the session
//! controller.
//!
//! # Depth
//!
//! - `0`: inactive (no session)
//! - `1..=MAX_LAYERS`: active; never drops below 1 through de-escalation

use crate::clock::SharedClock;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;

/// Maximum number of simultaneous layers
pub const MAX_LAYERS: usize = 7;

/// Depth a fresh session starts at
pub const BASELINE_DEPTH: usize = 1;

/// Audit entries retained
const AUDIT_CAPACITY: usize = 64;

/// One active layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Position in the stack (1 = innermost)
    pub position: usize,
    /// Opaque algorithm identifier
    pub algorithm: String,
    /// When the layer was pushed
    pub activated_at: Instant,
}

/// Kind of stack mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerChange {
    Pushed,
    Popped,
    Reset,
}

/// Audit record of a stack mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAuditEntry {
    pub change: LayerChange,
    /// Depth after the change
    pub depth: usize,
    /// Algorithm pushed or popped (none for resets)
    pub algorithm: Option<String>,
    pub at: Instant,
}

/// Adaptive multi-layer encryption stack
pub struct EncryptionLayerStack {
    layers: Vec<Layer>,
    algorithms: Vec<String>,
    audit: VecDeque<LayerAuditEntry>,
    clock: SharedClock,
}

impl EncryptionLayerStack {
    /// Create an inactive stack
    ///
    /// New layers take their algorithm from `algorithms`, cycled by
    /// position.
    pub fn new(algorithms: Vec<String>, clock: SharedClock) -> Self {
        Self {
            layers: Vec::with_capacity(MAX_LAYERS),
            algorithms,
            audit: VecDeque::with_capacity(AUDIT_CAPACITY),
            clock,
        }
    }

    /// Current number of layers
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Is the stack carrying traffic?
    pub fn is_active(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Active layers, innermost first
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Most recent mutations, oldest first
    pub fn audit(&self) -> impl Iterator<Item = &LayerAuditEntry> {
        self.audit.iter()
    }

    /// When the outermost layer was added
    pub fn last_change_at(&self) -> Option<Instant> {
        self.layers.last().map(|l| l.activated_at)
    }

    fn algorithm_for(&self, position: usize) -> String {
        if self.algorithms.is_empty() {
            return format!("ojas-layer-{}", position);
        }
        self.algorithms[(position - 1) % self.algorithms.len()].clone()
    }

    fn record(&mut self, change: LayerChange, algorithm: Option<String>, at: Instant) {
        if self.audit.len() == AUDIT_CAPACITY {
            self.audit.pop_front();
        }
        self.audit.push_back(LayerAuditEntry {
            change,
            depth: self.layers.len(),
            algorithm,
            at,
        });
    }

    fn push(&mut self, at: Instant) {
        let position = self.layers.len() + 1;
        let algorithm = self.algorithm_for(position);
        self.layers.push(Layer {
            position,
            algorithm,
            activated_at: at,
        });
    }

    /// Clear and rebuild with `baseline` layers (capped at `MAX_LAYERS`)
    ///
    /// Always legal and idempotent. `reset(0)` leaves the stack inactive.
    pub fn reset(&mut self, baseline: usize) -> usize {
        let now = self.clock.now();
        self.layers.clear();
        for _ in 0..baseline.min(MAX_LAYERS) {
            self.push(now);
        }
        self.record(LayerChange::Reset, None, now);
        debug!("Layer stack reset to depth {}", self.depth());
        self.depth()
    }

    /// Add one layer
    ///
    /// Saturates at `MAX_LAYERS`; an inactive stack is left untouched.
    pub fn escalate(&mut self) -> usize {
        if !self.is_active() || self.depth() >= MAX_LAYERS {
            return self.depth();
        }

        let now = self.clock.now();
        self.push(now);
        let algorithm = self.layers.last().map(|l| l.algorithm.clone());
        self.record(LayerChange::Pushed, algorithm, now);
        self.depth()
    }

    /// Remove the outermost layer
    ///
    /// Never drops below one layer.
    pub fn deescalate(&mut self) -> usize {
        if self.depth() <= BASELINE_DEPTH {
            return self.depth();
        }

        let now = self.clock.now();
        let popped = self.layers.pop().map(|l| l.algorithm);
        self.record(LayerChange::Popped, popped, now);
        self.depth()
    }
}

impl std::fmt::Debug for EncryptionLayerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionLayerStack")
            .field("layers", &self.layers)
            .field("audit_len", &self.audit.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn stack() -> (EncryptionLayerStack, ManualClock) {
        let clock = ManualClock::new();
        let algorithms = vec!["aes-256-gcm".to_string(), "chacha20-poly1305".to_string()];
        (EncryptionLayerStack::new(algorithms, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_starts_inactive() {
        let (mut stack, _) = stack();

        assert_eq!(stack.depth(), 0);
        assert!(!stack.is_active());
        // Inactive stack ignores escalation
        assert_eq!(stack.escalate(), 0);
        assert_eq!(stack.deescalate(), 0);
    }

    #[test]
    fn test_escalate_saturates() {
        let (mut stack, _) = stack();
        stack.reset(BASELINE_DEPTH);

        for _ in 0..=MAX_LAYERS {
            stack.escalate();
        }
        assert_eq!(stack.depth(), MAX_LAYERS);
        assert_eq!(stack.escalate(), MAX_LAYERS);
    }

    #[test]
    fn test_deescalate_floor() {
        let (mut stack, _) = stack();
        stack.reset(BASELINE_DEPTH);
        stack.escalate();
        stack.escalate();

        for _ in 0..10 {
            stack.deescalate();
        }
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_algorithms_cycle_by_position() {
        let (mut stack, _) = stack();
        stack.reset(3);

        let algs: Vec<_> = stack.layers().iter().map(|l| l.algorithm.as_str()).collect();
        assert_eq!(algs, ["aes-256-gcm", "chacha20-poly1305", "aes-256-gcm"]);
        assert_eq!(stack.layers()[2].position, 3);
    }

    #[test]
    fn test_fresh_timestamps() {
        let (mut stack, clock) = stack();
        stack.reset(BASELINE_DEPTH);
        let base = stack.last_change_at().unwrap();

        clock.advance(Duration::from_secs(5));
        stack.escalate();
        assert_eq!(stack.last_change_at().unwrap() - base, Duration::from_secs(5));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (mut stack, _) = stack();
        stack.reset(BASELINE_DEPTH);
        stack.escalate();

        assert_eq!(stack.reset(BASELINE_DEPTH), 1);
        assert_eq!(stack.reset(BASELINE_DEPTH), 1);
        assert_eq!(stack.reset(0), 0);
        assert_eq!(stack.reset(0), 0);
        assert_eq!(stack.reset(99), MAX_LAYERS);
    }

    #[test]
    fn test_audit_records_each_step() {
        let (mut stack, _) = stack();
        stack.reset(BASELINE_DEPTH);
        stack.escalate();
        stack.deescalate();
        // Saturated no-op is not recorded
        stack.deescalate();

        let changes: Vec<_> = stack.audit().map(|e| (e.change, e.depth)).collect();
        assert_eq!(
            changes,
            [
                (LayerChange::Reset, 1),
                (LayerChange::Pushed, 2),
                (LayerChange::Popped, 1),
            ]
        );
    }

    #[test]
    fn test_audit_is_bounded() {
        let (mut stack, _) = stack();
        for _ in 0..100 {
            stack.reset(BASELINE_DEPTH);
        }
        assert_eq!(stack.audit().count(), AUDIT_CAPACITY);
    }
}

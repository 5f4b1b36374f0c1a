//! Threat Monitor
//!
//! Classifies telemetry into incident severity and reports it to the
//! session controller.
//!
//! # Severity progression
//!
//! ```text
//!   none ──▶ suspicious ──▶ active ──▶ none
//!     ▲           │
//!     └───────────┘
//! ```
//!
//! - `active` is only reachable after `suspicious` has been reported for a
//!   full observation window.
//! - While `active`, the report repeats at a fixed cadence until the
//!   controller acknowledges it or the maximum dwell time elapses; either
//!   resolves the incident to `none`.
//!
//! The monitor is a pure state machine driven by [`ThreatMonitor::poll`].
//! [`spawn_monitor`] wraps it in a background producer that samples a
//! [`TelemetrySource`] and queues events; it never touches session state.
//!
//! Every report carries the epoch of the arming it was produced under, so
//! a report still queued when the session is replaced can be recognised
//! and ignored.

use crate::clock::SharedClock;
use crate::config::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Incident severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Suspicious,
    Active,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Suspicious => "suspicious",
            Severity::Active => "active",
        };
        f.write_str(s)
    }
}

/// One report from the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatEvent {
    pub severity: Severity,
    pub detected_at: Instant,
    /// Short description of what triggered the report
    pub evidence: Option<String>,
    /// Arm epoch of the monitor that produced it; `None` for reports
    /// injected from elsewhere
    pub epoch: Option<u64>,
}

impl ThreatEvent {
    pub fn new(severity: Severity, detected_at: Instant) -> Self {
        Self {
            severity,
            detected_at,
            evidence: None,
            epoch: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

/// One telemetry observation
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Anomaly score in `[0, 1]`
    pub anomaly_score: f32,
    pub evidence: Option<String>,
}

impl TelemetrySample {
    /// Observation with nothing unusual in it
    pub fn quiet() -> Self {
        Self {
            anomaly_score: 0.0,
            evidence: None,
        }
    }

    pub fn scored(anomaly_score: f32, evidence: impl Into<String>) -> Self {
        Self {
            anomaly_score: anomaly_score.clamp(0.0, 1.0),
            evidence: Some(evidence.into()),
        }
    }
}

/// Where the background producer reads telemetry from
pub trait TelemetrySource: Send {
    /// Take the next observation
    fn sample(&mut self) -> Result<TelemetrySample, MonitorError>;
}

/// Push-fed telemetry source
///
/// Clones share one queue: traffic analyzers push samples, the monitor
/// drains them. An empty queue reads as a quiet sample; a closed feed
/// reads as a lost threat feed.
#[derive(Debug, Clone, Default)]
pub struct TelemetryFeed {
    inner: Arc<Mutex<FeedState>>,
}

#[derive(Debug, Default)]
struct FeedState {
    queue: VecDeque<TelemetrySample>,
    closed: bool,
}

impl TelemetryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an observation
    pub fn push(&self, sample: TelemetrySample) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(sample);
    }

    /// Mark the feed as lost
    pub fn close(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
    }

    /// Restore a lost feed
    pub fn reopen(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed = false;
    }
}

impl TelemetrySource for TelemetryFeed {
    fn sample(&mut self) -> Result<TelemetrySample, MonitorError> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(MonitorError::Unavailable("telemetry feed closed".into()));
        }
        Ok(state.queue.pop_front().unwrap_or_else(TelemetrySample::quiet))
    }
}

/// Severity classifier and incident state machine
pub struct ThreatMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    /// Events are only produced while armed (session connected)
    armed: bool,
    /// Bumped on every arm
    epoch: u64,
    severity: Severity,
    /// When the current severity was entered
    entered_at: Instant,
    last_active_report: Option<Instant>,
    acknowledged: bool,
    /// Strongest observation since the last poll
    pending: Option<TelemetrySample>,
}

impl ThreatMonitor {
    pub fn new(config: MonitorConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            armed: false,
            epoch: 0,
            severity: Severity::None,
            entered_at: now,
            last_active_report: None,
            acknowledged: false,
            pending: None,
        }
    }

    /// Current incident severity
    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Epoch stamped on reports since the last arm
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start producing events (session connected)
    ///
    /// Returns the new epoch.
    pub fn arm(&mut self) -> u64 {
        self.clear();
        self.armed = true;
        self.epoch += 1;
        debug!("Threat monitor armed (epoch {})", self.epoch);
        self.epoch
    }

    /// Stop producing events and forget any open incident
    pub fn disarm(&mut self) {
        self.clear();
        self.armed = false;
        debug!("Threat monitor disarmed");
    }

    fn clear(&mut self) {
        self.severity = Severity::None;
        self.entered_at = self.clock.now();
        self.last_active_report = None;
        self.acknowledged = false;
        self.pending = None;
    }

    /// Feed one observation; the strongest since the last poll wins
    pub fn observe(&mut self, sample: TelemetrySample) {
        let stronger = self
            .pending
            .as_ref()
            .is_none_or(|p| sample.anomaly_score > p.anomaly_score);
        if stronger {
            self.pending = Some(sample);
        }
    }

    /// Controller has responded to the active incident
    ///
    /// Returns false when there is no active incident to acknowledge.
    pub fn acknowledge(&mut self) -> bool {
        if self.severity != Severity::Active {
            return false;
        }
        self.acknowledged = true;
        true
    }

    fn classify(&self, score: f32) -> Severity {
        if score >= self.config.active_threshold {
            Severity::Active
        } else if score >= self.config.suspicious_threshold {
            Severity::Suspicious
        } else {
            Severity::None
        }
    }

    fn enter(&mut self, severity: Severity, now: Instant) {
        info!("Threat severity {} -> {}", self.severity, severity);
        self.severity = severity;
        self.entered_at = now;
        self.acknowledged = false;
        self.last_active_report = (severity == Severity::Active).then_some(now);
    }

    /// Advance the state machine by one observation window
    pub fn poll(&mut self) -> Option<ThreatEvent> {
        let epoch = self.epoch;
        self.advance().map(|event| event.with_epoch(epoch))
    }

    fn advance(&mut self) -> Option<ThreatEvent> {
        let sample = self.pending.take();
        if !self.armed {
            return None;
        }

        let now = self.clock.now();
        let (raw, evidence) = match sample {
            Some(s) => (self.classify(s.anomaly_score), s.evidence),
            None => (Severity::None, None),
        };
        let in_state = now.saturating_duration_since(self.entered_at);

        let event = match self.severity {
            Severity::None => {
                if raw == Severity::None {
                    return None;
                }
                // Never straight to active
                self.enter(Severity::Suspicious, now);
                ThreatEvent::new(Severity::Suspicious, now)
            }
            Severity::Suspicious => match raw {
                Severity::Active if in_state >= self.config.observation_window() => {
                    self.enter(Severity::Active, now);
                    ThreatEvent::new(Severity::Active, now)
                }
                Severity::None => {
                    self.enter(Severity::None, now);
                    ThreatEvent::new(Severity::None, now)
                }
                _ => ThreatEvent::new(Severity::Suspicious, now),
            },
            Severity::Active => {
                if self.acknowledged {
                    self.enter(Severity::None, now);
                    return Some(ThreatEvent::new(Severity::None, now).with_evidence("acknowledged"));
                }
                if in_state >= self.config.max_active_dwell() {
                    self.enter(Severity::None, now);
                    return Some(
                        ThreatEvent::new(Severity::None, now).with_evidence("dwell time elapsed"),
                    );
                }

                let since_report = self
                    .last_active_report
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if since_report < self.config.active_report_interval() {
                    return None;
                }
                self.last_active_report = Some(now);
                ThreatEvent::new(Severity::Active, now)
            }
        };

        Some(match evidence {
            Some(e) => event.with_evidence(e),
            None => event,
        })
    }
}

impl fmt::Debug for ThreatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatMonitor")
            .field("armed", &self.armed)
            .field("severity", &self.severity)
            .field("acknowledged", &self.acknowledged)
            .finish()
    }
}

/// Shared monitor handle
pub type SharedMonitor = Arc<Mutex<ThreatMonitor>>;

/// What the background producer queues for the controller
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorSignal {
    Threat(ThreatEvent),
    /// Threat feed lost; the controller keeps its current posture
    Unavailable(String),
    /// Threat feed restored after an outage
    Restored,
}

impl MonitorSignal {
    /// Changes reported exactly once; losing one would leave the
    /// controller's view stuck
    fn must_deliver(&self) -> bool {
        match self {
            MonitorSignal::Threat(event) => event.severity == Severity::None,
            MonitorSignal::Unavailable(_) | MonitorSignal::Restored => true,
        }
    }
}

/// Handle to the background producer; aborts the task on drop
#[derive(Debug)]
pub struct MonitorTask {
    handle: JoinHandle<()>,
}

impl MonitorTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the background producer
///
/// Every `interval` it samples `source`, feeds the monitor, and queues any
/// resulting event. Sends never block. A full queue drops repeated reports
/// but holds back resolutions and feed changes until there is room.
pub fn spawn_monitor(
    monitor: SharedMonitor,
    mut source: Box<dyn TelemetrySource>,
    interval: Duration,
    tx: mpsc::Sender<MonitorSignal>,
) -> MonitorTask {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut feed_lost = false;
        let mut backlog = VecDeque::new();

        'producer: loop {
            ticker.tick().await;
            if !flush(&tx, &mut backlog) {
                break;
            }

            let mut signals = Vec::with_capacity(2);
            match source.sample() {
                Err(e) => {
                    if feed_lost {
                        continue;
                    }
                    feed_lost = true;
                    warn!("Threat feed lost: {}", e);
                    signals.push(MonitorSignal::Unavailable(e.to_string()));
                }
                Ok(sample) => {
                    let event = {
                        let mut monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);
                        monitor.observe(sample);
                        monitor.poll()
                    };

                    if feed_lost {
                        feed_lost = false;
                        info!("Threat feed restored");
                        signals.push(MonitorSignal::Restored);
                    }
                    signals.extend(event.map(MonitorSignal::Threat));
                }
            }

            for signal in signals {
                if !deliver(&tx, &mut backlog, signal) {
                    break 'producer;
                }
            }
        }
        debug!("Threat monitor task stopped");
    });

    MonitorTask { handle }
}

/// Send held signals in order; false once the controller is gone
fn flush(tx: &mpsc::Sender<MonitorSignal>, backlog: &mut VecDeque<MonitorSignal>) -> bool {
    while let Some(signal) = backlog.pop_front() {
        match tx.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => {
                backlog.push_front(signal);
                return true;
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}

/// Queue a signal without waiting; false once the controller is gone
fn deliver(
    tx: &mpsc::Sender<MonitorSignal>,
    backlog: &mut VecDeque<MonitorSignal>,
    signal: MonitorSignal,
) -> bool {
    // Nothing may overtake a held signal
    if !backlog.is_empty() {
        if signal.must_deliver() {
            backlog.push_back(signal);
        } else {
            warn!("Threat event queue full, dropping {:?}", signal);
        }
        return true;
    }

    match tx.try_send(signal) {
        Ok(()) => true,
        Err(TrySendError::Full(held)) if held.must_deliver() => {
            debug!("Threat event queue full, holding {:?}", held);
            backlog.push_back(held);
            true
        }
        Err(TrySendError::Full(dropped)) => {
            warn!("Threat event queue full, dropping {:?}", dropped);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Threat feed unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(3);
    const CADENCE: Duration = Duration::from_secs(2);
    const DWELL: Duration = Duration::from_secs(30);

    fn monitor() -> (ThreatMonitor, ManualClock) {
        let clock = ManualClock::new();
        let config = MonitorConfig {
            observation_window_ms: WINDOW.as_millis() as u64,
            active_report_interval_ms: CADENCE.as_millis() as u64,
            max_active_dwell_ms: DWELL.as_millis() as u64,
            ..MonitorConfig::default()
        };
        let mut monitor = ThreatMonitor::new(config, Arc::new(clock.clone()));
        assert_eq!(monitor.arm(), 1);
        (monitor, clock)
    }

    fn step(monitor: &mut ThreatMonitor, clock: &ManualClock, score: f32) -> Option<Severity> {
        clock.advance(Duration::from_secs(1));
        monitor.observe(TelemetrySample::scored(score, "test"));
        monitor.poll().map(|e| e.severity)
    }

    /// Drive the monitor into `active`
    fn activate(monitor: &mut ThreatMonitor, clock: &ManualClock) {
        assert_eq!(step(monitor, clock, 0.9), Some(Severity::Suspicious));
        clock.advance(WINDOW);
        assert_eq!(step(monitor, clock, 0.9), Some(Severity::Active));
    }

    #[test]
    fn test_quiet_traffic_reports_nothing() {
        let (mut monitor, clock) = monitor();
        for _ in 0..5 {
            assert_eq!(step(&mut monitor, &clock, 0.1), None);
        }
        assert_eq!(monitor.severity(), Severity::None);
    }

    #[test]
    fn test_disarmed_reports_nothing() {
        let (mut monitor, clock) = monitor();
        monitor.disarm();

        assert_eq!(step(&mut monitor, &clock, 0.95), None);
        assert_eq!(monitor.severity(), Severity::None);
    }

    #[test]
    fn test_no_jump_from_none_to_active() {
        let (mut monitor, clock) = monitor();

        assert_eq!(step(&mut monitor, &clock, 0.95), Some(Severity::Suspicious));
        // Still inside the observation window
        assert_eq!(step(&mut monitor, &clock, 0.95), Some(Severity::Suspicious));
        clock.advance(WINDOW);
        assert_eq!(step(&mut monitor, &clock, 0.95), Some(Severity::Active));
    }

    #[test]
    fn test_suspicious_clears_to_none() {
        let (mut monitor, clock) = monitor();

        assert_eq!(step(&mut monitor, &clock, 0.5), Some(Severity::Suspicious));
        assert_eq!(step(&mut monitor, &clock, 0.5), Some(Severity::Suspicious));
        assert_eq!(step(&mut monitor, &clock, 0.0), Some(Severity::None));
        assert_eq!(step(&mut monitor, &clock, 0.0), None);
    }

    #[test]
    fn test_active_repeats_at_cadence() {
        let (mut monitor, clock) = monitor();
        activate(&mut monitor, &clock);

        // 1s later: inside cadence, silent
        assert_eq!(step(&mut monitor, &clock, 0.9), None);
        // 2s after the last report
        assert_eq!(step(&mut monitor, &clock, 0.9), Some(Severity::Active));
        // Signal dropping does not end an unacknowledged incident
        assert_eq!(step(&mut monitor, &clock, 0.0), None);
        assert_eq!(step(&mut monitor, &clock, 0.0), Some(Severity::Active));
    }

    #[test]
    fn test_acknowledge_resolves() {
        let (mut monitor, clock) = monitor();
        assert!(!monitor.acknowledge());

        activate(&mut monitor, &clock);
        assert!(monitor.acknowledge());

        clock.advance(Duration::from_millis(100));
        let event = monitor.poll().unwrap();
        assert_eq!(event.severity, Severity::None);
        assert_eq!(event.evidence.as_deref(), Some("acknowledged"));
        assert_eq!(monitor.severity(), Severity::None);
    }

    #[test]
    fn test_reports_carry_arm_epoch() {
        let (mut monitor, clock) = monitor();
        activate(&mut monitor, &clock);

        monitor.disarm();
        assert_eq!(monitor.arm(), 2);
        monitor.observe(TelemetrySample::scored(0.5, "scan"));
        let event = monitor.poll().unwrap();
        assert_eq!(event.epoch, Some(2));
        assert_eq!(ThreatEvent::new(Severity::Active, Instant::now()).epoch, None);
    }

    #[test]
    fn test_dwell_auto_resolves() {
        let (mut monitor, clock) = monitor();
        activate(&mut monitor, &clock);

        clock.advance(DWELL);
        let event = monitor.poll().unwrap();
        assert_eq!(event.severity, Severity::None);
        assert_eq!(event.evidence.as_deref(), Some("dwell time elapsed"));
    }

    #[test]
    fn test_strongest_observation_wins() {
        let (mut monitor, _clock) = monitor();
        monitor.observe(TelemetrySample::scored(0.6, "port scan"));
        monitor.observe(TelemetrySample::scored(0.1, "noise"));

        let event = monitor.poll().unwrap();
        assert_eq!(event.severity, Severity::Suspicious);
        assert_eq!(event.evidence.as_deref(), Some("port scan"));
    }

    #[test]
    fn test_feed_source() {
        let mut feed = TelemetryFeed::new();
        feed.push(TelemetrySample::scored(0.8, "burst"));

        assert_eq!(feed.sample().unwrap().anomaly_score, 0.8);
        assert_eq!(feed.sample().unwrap(), TelemetrySample::quiet());

        feed.close();
        assert!(matches!(feed.sample(), Err(MonitorError::Unavailable(_))));
        feed.reopen();
        assert!(feed.sample().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_producer() {
        let clock = ManualClock::new();
        let config = MonitorConfig {
            observation_window_ms: 0,
            ..MonitorConfig::default()
        };
        let shared: SharedMonitor =
            Arc::new(Mutex::new(ThreatMonitor::new(config, Arc::new(clock.clone()))));
        shared.lock().unwrap().arm();

        let feed = TelemetryFeed::new();
        feed.push(TelemetrySample::scored(0.9, "flood"));
        feed.push(TelemetrySample::scored(0.9, "flood"));

        let (tx, mut rx) = mpsc::channel(8);
        let _task = spawn_monitor(
            shared.clone(),
            Box::new(feed.clone()),
            Duration::from_millis(100),
            tx,
        );

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, MonitorSignal::Threat(ref e) if e.severity == Severity::Suspicious));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, MonitorSignal::Threat(ref e) if e.severity == Severity::Active));

        feed.close();
        assert!(matches!(rx.recv().await.unwrap(), MonitorSignal::Unavailable(_)));
        feed.reopen();
        assert_eq!(rx.recv().await.unwrap(), MonitorSignal::Restored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_holds_resolution() {
        let clock = ManualClock::new();
        let config = MonitorConfig {
            observation_window_ms: 0,
            ..MonitorConfig::default()
        };
        let shared: SharedMonitor =
            Arc::new(Mutex::new(ThreatMonitor::new(config, Arc::new(clock.clone()))));
        shared.lock().unwrap().arm();

        let feed = TelemetryFeed::new();
        feed.push(TelemetrySample::scored(0.5, "scan"));
        feed.push(TelemetrySample::scored(0.9, "flood"));

        // Room for one signal only
        let (tx, mut rx) = mpsc::channel(1);
        let _task = spawn_monitor(
            shared.clone(),
            Box::new(feed.clone()),
            Duration::from_millis(10),
            tx,
        );

        // t=0 suspicious fills the queue, t=10 active is dropped
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(shared.lock().unwrap().severity(), Severity::Active);
        assert!(shared.lock().unwrap().acknowledge());

        // t=20 the resolution finds the queue still full
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shared.lock().unwrap().severity(), Severity::None);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, MonitorSignal::Threat(ref e) if e.severity == Severity::Suspicious));
        let second = rx.recv().await.unwrap();
        match second {
            MonitorSignal::Threat(event) => {
                assert_eq!(event.severity, Severity::None);
                assert_eq!(event.evidence.as_deref(), Some("acknowledged"));
            }
            other => panic!("expected resolution, got {:?}", other),
        }
    }
}

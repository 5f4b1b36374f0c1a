//! Session Controller
//!
//! Owns the session lifecycle, the encryption layer stack, and the
//! reaction to threat reports.
//!
//! # Serialization
//!
//! Every transition runs under one async lock around the state machine,
//! so no two transitions interleave and readers only ever see settled
//! states. The one exception is the tunnel handshake: `connect` drops the
//! lock while the link comes up, leaving the session in `Connecting` where
//! a following `disconnect` can cancel it.
//!
//! # Threat reaction
//!
//! | Report       | Reaction                                         |
//! |--------------|--------------------------------------------------|
//! | `suspicious` | none (observation only)                          |
//! | `active`     | one escalation unless the last report was active |
//! | `none`       | one de-escalation if the incident escalated      |
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::builder(OjasConfig::default_config()).build()?;
//! let _pipeline = controller.spawn_threat_pipeline(Box::new(TelemetryFeed::new()));
//!
//! let snapshot = controller.connect("de1").await?;
//! println!("{}", snapshot.summary());
//!
//! controller.disconnect().await?;
//! ```

use crate::allocator::{AddressAllocator, AllocError};
use crate::clock::{SharedClock, system_clock};
use crate::config::{ConfigError, ControllerConfig, MonitorConfig, OjasConfig};
use crate::directory::{DirectoryError, Server, ServerDirectory};
use crate::kill_switch::KillSwitch;
use crate::layers::{BASELINE_DEPTH, EncryptionLayerStack, MAX_LAYERS};
use crate::link::{ImmediateLink, LinkError, TunnelLink};
use crate::monitor::{
    MonitorSignal, MonitorTask, Severity, SharedMonitor, TelemetrySource, ThreatEvent,
    ThreatMonitor, spawn_monitor,
};
use crate::session::{Session, SessionSnapshot, SessionState};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session controller errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Address pool exhausted for server {0}")]
    PoolExhausted(String),

    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("Threat monitor unavailable: {0}")]
    MonitorUnavailable(String),

    #[error("Connect cancelled")]
    ConnectCancelled,

    #[error("Connect deadline of {0:?} exceeded")]
    ConnectTimeout(Duration),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Address allocation error: {0}")]
    Alloc(AllocError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// May the caller retry after backing off?
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::PoolExhausted(_)
                | SessionError::MonitorUnavailable(_)
                | SessionError::ConnectCancelled
                | SessionError::ConnectTimeout(_)
                | SessionError::Link(_)
        )
    }
}

impl From<DirectoryError> for SessionError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(id) => SessionError::ServerNotFound(id),
            DirectoryError::Config(c) => SessionError::Config(c),
        }
    }
}

impl From<AllocError> for SessionError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::PoolExhausted(id) => SessionError::PoolExhausted(id),
            other => SessionError::Alloc(other),
        }
    }
}

/// Handle returned by [`SessionController::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

/// Open incident as seen by the controller
#[derive(Debug, Clone, Copy, Default)]
struct Incident {
    open: bool,
    escalated: bool,
}

/// Everything guarded by the transition lock
struct Machine {
    session: Session,
    layers: EncryptionLayerStack,
    incident: Incident,
    /// Address held from allocation until release; only shown once connected
    lease: Option<Ipv4Addr>,
    /// The link handshake completed for the current lease
    link_up: bool,
    /// Monitor epoch of the current session
    epoch: u64,
    /// Bumped on every connect so a stale handshake can tell it lost
    attempt: u64,
    /// Fires when an in-flight connect is cancelled
    cancel: Option<oneshot::Sender<()>>,
}

/// How the link handshake ended
enum Establish {
    Up,
    LinkFailed(LinkError),
    TimedOut(Duration),
    Cancelled,
}

struct Shared {
    config: ControllerConfig,
    monitor_config: MonitorConfig,
    directory: Arc<ServerDirectory>,
    allocator: Arc<AddressAllocator>,
    link: Arc<dyn TunnelLink>,
    clock: SharedClock,
    monitor: SharedMonitor,
    kill_switch: KillSwitch,
    machine: tokio::sync::Mutex<Machine>,
    subscribers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_subscription: AtomicU64,
}

impl Shared {
    fn snapshot(&self, m: &Machine) -> SessionSnapshot {
        m.session.snapshot(m.layers.depth(), self.clock.now())
    }

    /// Run every handler against the current state
    fn notify(&self, m: &Machine) {
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        if handlers.is_empty() {
            return;
        }

        let snapshot = self.snapshot(m);
        for handler in handlers {
            handler(&snapshot);
        }
    }

    fn transition(&self, m: &mut Machine, to: SessionState) {
        info!("Session {} -> {}", m.session.state, to);
        m.session.state = to;
        m.session.last_transition_at = self.clock.now();
        self.notify(m);
    }

    fn with_monitor<R>(&self, f: impl FnOnce(&mut ThreatMonitor) -> R) -> R {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut monitor)
    }

    /// Give back the lease and drop every layer
    fn release_resources(&self, m: &mut Machine) {
        self.kill_switch.on_session_down();
        self.with_monitor(ThreatMonitor::disarm);

        if let Some(addr) = m.lease.take() {
            if let Some(server) = m.session.server.as_ref() {
                if std::mem::take(&mut m.link_up) {
                    self.link.teardown(&server.id, addr);
                }
                self.allocator.release(&server.id, addr);
            }
        }

        m.link_up = false;
        m.session.virtual_address = None;
        m.layers.reset(0);
        m.incident = Incident::default();
        m.session.connected_at = None;
        m.session.last_threat = Severity::None;
    }

    /// Handshake failed: drop resources and park in `Failed`
    fn fail(&self, m: &mut Machine, err: &SessionError) {
        error!("Connect failed: {}", err);
        self.release_resources(m);
        m.session.failure = Some(err.to_string());
        self.transition(m, SessionState::Failed);
    }

    async fn establish(
        &self,
        server: &Server,
        address: Ipv4Addr,
        cancel: oneshot::Receiver<()>,
    ) -> Establish {
        let handshake = async {
            let link = self.link.establish(server, address);
            match self.config.connect_deadline() {
                Some(deadline) => match tokio::time::timeout(deadline, link).await {
                    Ok(Ok(())) => Establish::Up,
                    Ok(Err(e)) => Establish::LinkFailed(e),
                    Err(_) => Establish::TimedOut(deadline),
                },
                None => match link.await {
                    Ok(()) => Establish::Up,
                    Err(e) => Establish::LinkFailed(e),
                },
            }
        };

        tokio::select! {
            outcome = handshake => outcome,
            _ = cancel => Establish::Cancelled,
        }
    }

    fn apply_threat(&self, m: &mut Machine, event: &ThreatEvent) {
        if !m.session.state.is_connected() {
            debug!("Ignoring {} threat report while {}", event.severity, m.session.state);
            return;
        }
        if event.epoch.is_some_and(|epoch| epoch != m.epoch) {
            debug!("Ignoring {} threat report from an earlier session", event.severity);
            return;
        }

        let depth_before = m.layers.depth();
        let severity_before = m.session.last_threat;
        m.session.last_threat = event.severity;

        match event.severity {
            Severity::Suspicious => {
                if !m.incident.open {
                    info!(
                        "Suspicious traffic observed{}",
                        event.evidence.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
                    );
                }
                m.incident.open = true;
            }
            Severity::Active => {
                m.incident.open = true;
                // Repeats of the same report do not stack
                if severity_before != Severity::Active {
                    m.incident.escalated = true;
                    let depth = m.layers.escalate();
                    if depth == depth_before {
                        warn!("Active threat, layer stack already at maximum ({})", MAX_LAYERS);
                    } else {
                        warn!("Active threat, escalated to {} layers", depth);
                    }
                }
            }
            Severity::None => {
                if m.incident.open {
                    if m.incident.escalated {
                        let depth = m.layers.deescalate();
                        info!("Incident resolved, cooling down to {} layers", depth);
                    } else {
                        info!("Incident resolved without escalation");
                    }
                }
                m.incident = Incident::default();
            }
        }

        if m.layers.depth() != depth_before || m.session.last_threat != severity_before {
            self.notify(m);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Never leak a lease or leave traffic flowing
        let m = self.machine.get_mut();
        if let (Some(server), Some(addr)) = (m.session.server.as_ref(), m.lease.take()) {
            if m.link_up {
                self.link.teardown(&server.id, addr);
            }
            self.allocator.release(&server.id, addr);
        }
        self.kill_switch.on_session_down();
    }
}

/// Builder for [`SessionController`]
pub struct ControllerBuilder {
    config: OjasConfig,
    directory: Option<Arc<ServerDirectory>>,
    allocator: Option<Arc<AddressAllocator>>,
    link: Arc<dyn TunnelLink>,
    clock: SharedClock,
}

impl ControllerBuilder {
    /// Share a directory between controllers
    pub fn directory(mut self, directory: Arc<ServerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Share an allocator between controllers
    pub fn allocator(mut self, allocator: Arc<AddressAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn link(mut self, link: impl TunnelLink + 'static) -> Self {
        self.link = Arc::new(link);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<SessionController, SessionError> {
        self.config.validate()?;

        let directory = match self.directory {
            Some(d) => d,
            None => Arc::new(ServerDirectory::from_profiles(&self.config.servers)?),
        };
        let allocator = match self.allocator {
            Some(a) => a,
            None => Arc::new(AddressAllocator::from_directory(&directory)?),
        };

        let OjasConfig {
            controller, monitor, ..
        } = self.config;
        let now = self.clock.now();

        let machine = Machine {
            session: Session::new(now),
            layers: EncryptionLayerStack::new(
                controller.layer_algorithms.clone(),
                self.clock.clone(),
            ),
            incident: Incident::default(),
            lease: None,
            link_up: false,
            epoch: 0,
            attempt: 0,
            cancel: None,
        };

        Ok(SessionController {
            shared: Arc::new(Shared {
                kill_switch: KillSwitch::new(controller.kill_switch),
                monitor: Arc::new(Mutex::new(ThreatMonitor::new(
                    monitor.clone(),
                    self.clock.clone(),
                ))),
                config: controller,
                monitor_config: monitor,
                directory,
                allocator,
                link: self.link,
                clock: self.clock,
                machine: tokio::sync::Mutex::new(machine),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }
}

/// Background producer plus the task feeding its reports to the controller
///
/// Dropping the pipeline stops both tasks.
#[derive(Debug)]
pub struct ThreatPipeline {
    _producer: MonitorTask,
    reactor: JoinHandle<()>,
}

impl Drop for ThreatPipeline {
    fn drop(&mut self) {
        self.reactor.abort();
    }
}

/// The session state machine
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Start building a controller from configuration
    pub fn builder(config: OjasConfig) -> ControllerBuilder {
        ControllerBuilder {
            config,
            directory: None,
            allocator: None,
            link: Arc::new(ImmediateLink),
            clock: system_clock(),
        }
    }

    /// All servers, in catalog order
    pub fn list_servers(&self) -> Vec<Server> {
        self.shared.directory.list()
    }

    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.shared.directory
    }

    pub fn allocator(&self) -> &Arc<AddressAllocator> {
        &self.shared.allocator
    }

    /// Kill switch handle for the data path
    pub fn kill_switch(&self) -> KillSwitch {
        self.shared.kill_switch.clone()
    }

    /// Current session view
    pub async fn current_state(&self) -> SessionSnapshot {
        let m = self.shared.machine.lock().await;
        self.shared.snapshot(&m)
    }

    /// Connect to a server
    ///
    /// Legal only from `Disconnected`. An unknown server leaves the session
    /// untouched; an exhausted pool passes through `Failed` back to
    /// `Disconnected`; a failed or timed-out handshake parks the session in
    /// `Failed` until [`acknowledge`](Self::acknowledge).
    pub async fn connect(&self, server_id: &str) -> Result<SessionSnapshot, SessionError> {
        let shared = &self.shared;

        let (server, address, attempt, cancel) = {
            let mut m = shared.machine.lock().await;
            if m.session.state != SessionState::Disconnected {
                return Err(SessionError::InvalidTransition {
                    from: m.session.state,
                    action: "connect",
                });
            }

            let server = shared.directory.get(server_id)?;
            if !server.health.is_usable() {
                warn!("Connecting to {} although it is {}", server.id, server.health);
            }
            info!("Connecting to {} ({})", server.name, server.location);

            m.session.server = Some(server.clone());
            m.session.failure = None;
            shared.transition(&mut m, SessionState::Connecting);

            let address = match shared.allocator.allocate(&server.id) {
                Ok(addr) => addr,
                Err(e) => {
                    let err = SessionError::from(e);
                    error!("Connect to {} failed: {}", server.id, err);
                    m.session.failure = Some(err.to_string());
                    shared.transition(&mut m, SessionState::Failed);
                    shared.transition(&mut m, SessionState::Disconnected);
                    return Err(err);
                }
            };

            m.lease = Some(address);
            m.layers.reset(BASELINE_DEPTH);
            shared.notify(&m);

            m.attempt += 1;
            let (tx, rx) = oneshot::channel();
            m.cancel = Some(tx);
            (server, address, m.attempt, rx)
        };

        let outcome = shared.establish(&server, address, cancel).await;

        let mut m = shared.machine.lock().await;
        if m.attempt != attempt || m.session.state != SessionState::Connecting {
            info!("Connect to {} was cancelled", server.id);
            return Err(SessionError::ConnectCancelled);
        }
        m.cancel = None;

        match outcome {
            Establish::Up => {
                m.link_up = true;
                m.session.virtual_address = Some(address);
                m.session.connected_at = Some(shared.clock.now());
                m.session.last_threat = Severity::None;
                m.incident = Incident::default();
                shared.kill_switch.on_session_up();
                m.epoch = shared.with_monitor(ThreatMonitor::arm);
                shared.transition(&mut m, SessionState::Connected);

                info!(
                    "Connected to {} as {} ({} layer)",
                    server.name,
                    address,
                    m.layers.depth()
                );
                Ok(shared.snapshot(&m))
            }
            Establish::Cancelled => {
                shared.transition(&mut m, SessionState::Disconnecting);
                shared.release_resources(&mut m);
                shared.transition(&mut m, SessionState::Disconnected);
                Err(SessionError::ConnectCancelled)
            }
            Establish::LinkFailed(e) => {
                let err = SessionError::Link(e);
                shared.fail(&mut m, &err);
                Err(err)
            }
            Establish::TimedOut(deadline) => {
                let err = SessionError::ConnectTimeout(deadline);
                shared.fail(&mut m, &err);
                Err(err)
            }
        }
    }

    /// Tear the session down
    ///
    /// Cancels an in-flight connect. A no-op when already disconnected;
    /// illegal from `Failed`.
    pub async fn disconnect(&self) -> Result<SessionSnapshot, SessionError> {
        let shared = &self.shared;
        let mut m = shared.machine.lock().await;

        match m.session.state {
            SessionState::Disconnected => {
                debug!("Disconnect ignored, already disconnected");
                return Ok(shared.snapshot(&m));
            }
            SessionState::Connecting | SessionState::Connected => {}
            from @ (SessionState::Failed | SessionState::Disconnecting) => {
                return Err(SessionError::InvalidTransition {
                    from,
                    action: "disconnect",
                });
            }
        }

        shared.transition(&mut m, SessionState::Disconnecting);
        if let Some(cancel) = m.cancel.take() {
            info!("Cancelling in-flight connect");
            let _ = cancel.send(());
        }
        shared.release_resources(&mut m);
        shared.transition(&mut m, SessionState::Disconnected);

        Ok(shared.snapshot(&m))
    }

    /// Clear a failed session back to `Disconnected`
    pub async fn acknowledge(&self) -> Result<SessionSnapshot, SessionError> {
        let shared = &self.shared;
        let mut m = shared.machine.lock().await;

        if !m.session.state.is_failed() {
            return Err(SessionError::InvalidTransition {
                from: m.session.state,
                action: "acknowledge",
            });
        }

        m.session.failure = None;
        shared.transition(&mut m, SessionState::Disconnected);
        Ok(shared.snapshot(&m))
    }

    /// React to one threat report
    ///
    /// Reports arriving while not connected are ignored.
    pub async fn handle_threat(&self, event: ThreatEvent) -> SessionSnapshot {
        let mut m = self.shared.machine.lock().await;
        self.shared.apply_threat(&mut m, &event);
        self.shared.snapshot(&m)
    }

    /// React to one signal from the background producer
    pub async fn handle_signal(&self, signal: MonitorSignal) {
        match signal {
            MonitorSignal::Threat(event) => {
                self.handle_threat(event).await;
            }
            MonitorSignal::Unavailable(reason) => {
                let mut m = self.shared.machine.lock().await;
                warn!(
                    "Threat monitor unavailable ({}), holding {} layers",
                    reason,
                    m.layers.depth()
                );
                if m.session.threat_feed_available {
                    m.session.threat_feed_available = false;
                    self.shared.notify(&m);
                }
            }
            MonitorSignal::Restored => {
                let mut m = self.shared.machine.lock().await;
                info!("Threat monitor available again");
                if !m.session.threat_feed_available {
                    m.session.threat_feed_available = true;
                    self.shared.notify(&m);
                }
            }
        }
    }

    /// Tell the monitor the active incident has been dealt with
    ///
    /// Returns false when no incident is active.
    pub fn acknowledge_threat(&self) -> bool {
        let acked = self.shared.with_monitor(ThreatMonitor::acknowledge);
        if acked {
            info!("Active threat acknowledged");
        }
        acked
    }

    /// Is the threat feed currently delivering?
    pub async fn threat_feed_status(&self) -> Result<(), SessionError> {
        let m = self.shared.machine.lock().await;
        if m.session.threat_feed_available {
            Ok(())
        } else {
            Err(SessionError::MonitorUnavailable("threat feed lost".into()))
        }
    }

    /// Record the externally observed public address
    pub async fn set_public_address(&self, addr: Option<IpAddr>) {
        self.shared.machine.lock().await.session.public_address = addr;
    }

    /// Shared handle to the threat monitor
    pub fn monitor(&self) -> SharedMonitor {
        self.shared.monitor.clone()
    }

    /// Start the background threat producer and the task feeding its
    /// reports back into this controller
    pub fn spawn_threat_pipeline(&self, source: Box<dyn TelemetrySource>) -> ThreatPipeline {
        let config = &self.shared.monitor_config;
        let (tx, mut rx) = mpsc::channel(config.queue_depth);

        let producer = spawn_monitor(self.shared.monitor.clone(), source, config.poll_interval(), tx);

        let controller = self.clone();
        let reactor = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                controller.handle_signal(signal).await;
            }
            debug!("Threat reactor stopped");
        });

        ThreatPipeline {
            _producer: producer,
            reactor,
        }
    }

    /// Register a handler run on every state, depth, threat, or feed change
    ///
    /// Handlers run inside the transition and must not block.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Remove a handler; false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }
}

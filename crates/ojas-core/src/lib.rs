//! OJAS Core - VPN Session Manager with Adaptive Encryption Layers
//!
//! Manages one VPN session at a time against a catalog of exit servers,
//! leasing each session a virtual address and wrapping its traffic in a
//! stack of encryption layers whose depth follows the observed threat level.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Session Controller                      │
//! │                                                           │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────────────┐  │
//! │  │  Server   │──▶│  Address    │──▶│   Tunnel Link    │  │
//! │  │ Directory │   │  Allocator  │   │   (handshake)    │  │
//! │  └───────────┘   └─────────────┘   └──────────────────┘  │
//! │                                                           │
//! │  ┌──────────────────┐         ┌───────────────────────┐  │
//! │  │ Encryption Layer │◀────────│   threat reactor      │  │
//! │  │      Stack       │         └───────────▲───────────┘  │
//! │  └──────────────────┘                     │ mpsc          │
//! └───────────────────────────────────────────│───────────────┘
//!                                             │
//!                                 ┌───────────┴───────────┐
//!                                 │    Threat Monitor     │
//!                                 │ (background producer) │
//!                                 └───────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Serialized lifecycle**: every transition runs under one lock
//! - **Adaptive layering**: one extra layer per active incident, up to 7
//! - **Cancellable connect**: with a configurable deadline
//! - **Kill switch**: traffic refused whenever the session is down

pub mod allocator;
pub mod clock;
pub mod config;
pub mod controller;
pub mod directory;
pub mod kill_switch;
pub mod layers;
pub mod link;
pub mod monitor;
mod session;

pub use allocator::{AddressAllocator, AllocError, PoolRange};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{ConfigError, ConfigFormat, ControllerConfig, MonitorConfig, OjasConfig, ServerProfile};
pub use controller::{
    ControllerBuilder, SessionController, SessionError, SubscriptionId, ThreatPipeline,
};
pub use directory::{DirectoryError, HealthRecord, HealthStatus, Server, ServerDirectory};
pub use kill_switch::{KillSwitch, KillSwitchError, KillSwitchState};
pub use layers::{
    BASELINE_DEPTH, EncryptionLayerStack, Layer, LayerAuditEntry, LayerChange, MAX_LAYERS,
};
pub use link::{DelayedLink, ImmediateLink, LinkError, TunnelLink};
pub use monitor::{
    MonitorError, MonitorSignal, MonitorTask, Severity, SharedMonitor, TelemetryFeed,
    TelemetrySample, TelemetrySource, ThreatEvent, ThreatMonitor, spawn_monitor,
};
pub use session::{SessionSnapshot, SessionState};

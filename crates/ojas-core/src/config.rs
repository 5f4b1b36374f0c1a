//! OJAS Configuration
//!
//! Loads the server catalog, controller, and threat monitor settings from
//! TOML or JSON.
//!
//! # Example
//!
//! ```toml
//! auto_connect = "de1"
//!
//! [controller]
//! connect_deadline_ms = 10000
//! layer_algorithms = ["aes-256-gcm", "chacha20-poly1305"]
//! kill_switch = true
//!
//! [monitor]
//! poll_interval_ms = 1000
//! suspicious_threshold = 0.4
//! active_threshold = 0.75
//!
//! [[servers]]
//! id = "de1"
//! name = "Germany"
//! location = "Frankfurt"
//! pool = "10.0.6.0/24"
//! ```

use crate::allocator::PoolRange;
use crate::directory::HealthStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Session controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Deadline for an in-flight connect (0 = no deadline)
    #[serde(default = "default_connect_deadline_ms")]
    pub connect_deadline_ms: u64,
    /// Algorithm identifiers assigned to layers, cycled by depth
    #[serde(default = "default_layer_algorithms")]
    pub layer_algorithms: Vec<String>,
    /// Block traffic whenever the session is not connected
    #[serde(default = "default_true")]
    pub kill_switch: bool,
}

impl ControllerConfig {
    /// Connect deadline, if one is configured
    pub fn connect_deadline(&self) -> Option<Duration> {
        (self.connect_deadline_ms > 0).then(|| Duration::from_millis(self.connect_deadline_ms))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_deadline_ms: default_connect_deadline_ms(),
            layer_algorithms: default_layer_algorithms(),
            kill_switch: true,
        }
    }
}

/// Threat monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the background producer samples telemetry
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum time spent in `suspicious` before `active` may be reported
    #[serde(default = "default_observation_window_ms")]
    pub observation_window_ms: u64,
    /// Cadence of repeated `active` reports
    #[serde(default = "default_active_report_interval_ms")]
    pub active_report_interval_ms: u64,
    /// An unacknowledged `active` incident auto-resolves after this long
    #[serde(default = "default_max_active_dwell_ms")]
    pub max_active_dwell_ms: u64,
    /// Anomaly score at or above which traffic is suspicious
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: f32,
    /// Anomaly score at or above which an attack is considered active
    #[serde(default = "default_active_threshold")]
    pub active_threshold: f32,
    /// Capacity of the event queue between monitor and controller
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_millis(self.observation_window_ms)
    }

    pub fn active_report_interval(&self) -> Duration {
        Duration::from_millis(self.active_report_interval_ms)
    }

    pub fn max_active_dwell(&self) -> Duration {
        Duration::from_millis(self.max_active_dwell_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            observation_window_ms: default_observation_window_ms(),
            active_report_interval_ms: default_active_report_interval_ms(),
            max_active_dwell_ms: default_max_active_dwell_ms(),
            suspicious_threshold: default_suspicious_threshold(),
            active_threshold: default_active_threshold(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Stable identifier (e.g. "us1")
    pub id: String,
    /// Display name
    pub name: String,
    /// City or datacenter
    pub location: String,
    /// Virtual address pool in CIDR notation
    pub pool: String,
    /// Health at catalog load
    #[serde(default)]
    pub health: HealthStatus,
}

impl ServerProfile {
    pub fn new(id: &str, name: &str, location: &str, pool: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            pool: pool.to_string(),
            health: HealthStatus::Healthy,
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OjasConfig {
    /// Server to connect to at startup
    #[serde(default)]
    pub auto_connect: Option<String>,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Server catalog, in display order
    pub servers: Vec<ServerProfile>,
}

fn default_true() -> bool {
    true
}

fn default_connect_deadline_ms() -> u64 {
    10_000
}

fn default_layer_algorithms() -> Vec<String> {
    [
        "aes-256-gcm",
        "chacha20-poly1305",
        "serpent-256-ctr",
        "twofish-256-ctr",
        "camellia-256-gcm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_observation_window_ms() -> u64 {
    3_000
}

fn default_active_report_interval_ms() -> u64 {
    2_000
}

fn default_max_active_dwell_ms() -> u64 {
    30_000
}

fn default_suspicious_threshold() -> f32 {
    0.4
}

fn default_active_threshold() -> f32 {
    0.75
}

fn default_queue_depth() -> usize {
    64
}

impl OjasConfig {
    /// Load from a file, picking the format from the extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("json") => ConfigFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_str_format(&content, format)
    }

    /// Parse from a string in the given format
    pub fn from_str_format(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Built-in catalog: one server per panel location
    pub fn default_config() -> Self {
        Self {
            auto_connect: None,
            controller: ControllerConfig::default(),
            monitor: MonitorConfig::default(),
            servers: vec![
                ServerProfile::new("us1", "United States", "New York", "10.0.1.0/24"),
                ServerProfile::new("nl1", "Netherlands", "Amsterdam", "10.0.2.0/24"),
                ServerProfile::new("jp1", "Japan", "Tokyo", "10.0.3.0/24"),
                ServerProfile::new("sg1", "Singapore", "Singapore", "10.0.4.0/24"),
                ServerProfile::new("uk1", "United Kingdom", "London", "10.0.5.0/24"),
                ServerProfile::new("de1", "Germany", "Frankfurt", "10.0.6.0/24"),
                ServerProfile::new("ca1", "Canada", "Toronto", "10.0.7.0/24"),
                ServerProfile::new("au1", "Australia", "Sydney", "10.0.8.0/24"),
            ],
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }

        let mut seen = HashSet::new();
        let mut pools: Vec<(&str, PoolRange)> = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }

            let range = PoolRange::parse(&server.pool).map_err(|e| ConfigError::InvalidPool {
                server: server.id.clone(),
                reason: e.to_string(),
            })?;

            if let Some((other, _)) = pools.iter().find(|(_, r)| r.overlaps(&range)) {
                return Err(ConfigError::OverlappingPools(other.to_string(), server.id.clone()));
            }
            pools.push((server.id.as_str(), range));
        }

        let m = &self.monitor;
        let in_range = |t: f32| t > 0.0 && t <= 1.0;
        if !in_range(m.suspicious_threshold)
            || !in_range(m.active_threshold)
            || m.suspicious_threshold >= m.active_threshold
        {
            return Err(ConfigError::InvalidThresholds);
        }
        if m.poll_interval_ms == 0 || m.queue_depth == 0 {
            return Err(ConfigError::InvalidMonitor);
        }

        if self.controller.layer_algorithms.is_empty() {
            return Err(ConfigError::NoAlgorithms);
        }

        if let Some(ref id) = self.auto_connect {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::UnknownAutoConnect(id.clone()));
            }
        }

        Ok(())
    }
}

impl Default for OjasConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("Server catalog is empty")]
    EmptyCatalog,

    #[error("Duplicate server id: {0}")]
    DuplicateServer(String),

    #[error("Invalid pool for server {server}: {reason}")]
    InvalidPool { server: String, reason: String },

    #[error("Pools of {0} and {1} overlap")]
    OverlappingPools(String, String),

    #[error("Threat thresholds must satisfy 0 < suspicious < active <= 1")]
    InvalidThresholds,

    #[error("Monitor poll interval and queue depth must be non-zero")]
    InvalidMonitor,

    #[error("At least one layer algorithm is required")]
    NoAlgorithms,

    #[error("Auto-connect server not in catalog: {0}")]
    UnknownAutoConnect(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OjasConfig::default_config();

        assert_eq!(config.servers.len(), 8);
        assert_eq!(config.servers[0].id, "us1");
        assert_eq!(config.servers[5].pool, "10.0.6.0/24");
        assert!(config.controller.kill_switch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = OjasConfig::default_config();
        let toml = config.to_toml().unwrap();

        let parsed = OjasConfig::from_str_format(&toml, ConfigFormat::Toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let content = r#"
            [[servers]]
            id = "de1"
            name = "Germany"
            location = "Frankfurt"
            pool = "10.0.6.0/24"
        "#;

        let config = OjasConfig::from_str_format(content, ConfigFormat::Toml).unwrap();
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.controller.connect_deadline(), Some(Duration::from_secs(10)));
        assert_eq!(config.servers[0].health, HealthStatus::Healthy);
    }

    #[test]
    fn test_json_with_health() {
        let content = r#"{
            "servers": [
                {"id": "jp1", "name": "Japan", "location": "Tokyo",
                 "pool": "10.0.3.0/24", "health": "degraded"}
            ],
            "controller": {"connect_deadline_ms": 0}
        }"#;

        let config = OjasConfig::from_str_format(content, ConfigFormat::Json).unwrap();
        assert_eq!(config.servers[0].health, HealthStatus::Degraded);
        assert_eq!(config.controller.connect_deadline(), None);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config = OjasConfig::default_config();
        config.servers[1].id = "us1".to_string();
        config.servers[1].pool = "10.9.0.0/24".to_string();

        assert_eq!(config.validate(), Err(ConfigError::DuplicateServer("us1".into())));
    }

    #[test]
    fn test_rejects_overlapping_pools() {
        let mut config = OjasConfig::default_config();
        config.servers[1].pool = "10.0.0.0/16".to_string();

        assert_eq!(
            config.validate(),
            Err(ConfigError::OverlappingPools("us1".into(), "nl1".into()))
        );
    }

    #[test]
    fn test_rejects_bad_pool() {
        let mut config = OjasConfig::default_config();
        config.servers[0].pool = "10.0.1.0/31".to_string();

        assert!(matches!(config.validate(), Err(ConfigError::InvalidPool { .. })));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = OjasConfig::default_config();
        config.monitor.suspicious_threshold = 0.9;

        assert_eq!(config.validate(), Err(ConfigError::InvalidThresholds));
    }

    #[test]
    fn test_rejects_unknown_auto_connect() {
        let mut config = OjasConfig::default_config();
        config.auto_connect = Some("mars1".to_string());

        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownAutoConnect("mars1".into()))
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let result = OjasConfig::from_file(Path::new("ojas.yaml"));
        assert_eq!(result, Err(ConfigError::UnsupportedFormat));
    }
}

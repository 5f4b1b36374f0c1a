//! Server Directory
//!
//! Read-only catalog of tunnel endpoints, loaded once from configuration.
//! Identity, name, location and pool never change after load; only the
//! health view is refreshed, by an external checker feeding ping results.

use crate::allocator::PoolRange;
use crate::config::{ConfigError, ServerProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Consecutive ping failures before a server is unreachable
const FAILURES_UNREACHABLE: u32 = 3;

/// Packet loss (percent) at or above which a server is degraded
const DEGRADED_LOSS_PERCENT: f32 = 20.0;

/// Ping latency above which a server is degraded
const DEGRADED_LATENCY_MS: u32 = 400;

/// Server health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    /// Can a session reasonably be placed here?
    pub fn is_usable(&self) -> bool {
        !matches!(self, HealthStatus::Unreachable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Catalog entry as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub location: String,
    pub health: HealthStatus,
}

/// Ping history for one server
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    /// Derived status
    pub status: HealthStatus,
    /// Latest ping latency (ms)
    pub latency_ms: Option<u32>,
    /// Pings sent
    pub pings_sent: u64,
    /// Pings answered
    pub pings_answered: u64,
    /// Failures since the last answered ping
    pub consecutive_failures: u32,
}

impl HealthRecord {
    fn new(status: HealthStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Ping loss percentage
    pub fn packet_loss(&self) -> f32 {
        if self.pings_sent == 0 {
            0.0
        } else {
            ((self.pings_sent - self.pings_answered) as f32 / self.pings_sent as f32) * 100.0
        }
    }

    fn record_success(&mut self, latency_ms: u32) {
        self.pings_sent += 1;
        self.pings_answered += 1;
        self.consecutive_failures = 0;
        self.latency_ms = Some(latency_ms);

        self.status = if self.packet_loss() >= DEGRADED_LOSS_PERCENT
            || latency_ms > DEGRADED_LATENCY_MS
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }

    fn record_failure(&mut self) {
        self.pings_sent += 1;
        self.consecutive_failures += 1;

        if self.consecutive_failures >= FAILURES_UNREACHABLE {
            self.status = HealthStatus::Unreachable;
        } else if self.packet_loss() >= DEGRADED_LOSS_PERCENT {
            self.status = HealthStatus::Degraded;
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: String,
    name: String,
    location: String,
    pool: PoolRange,
}

/// Catalog of available servers
#[derive(Debug)]
pub struct ServerDirectory {
    /// Entries in catalog order
    entries: Vec<Entry>,
    /// id -> index into `entries`
    index: HashMap<String, usize>,
    /// Refreshable health view
    health: RwLock<HashMap<String, HealthRecord>>,
}

impl ServerDirectory {
    /// Load the catalog from configuration profiles
    pub fn from_profiles(profiles: &[ServerProfile]) -> Result<Self, DirectoryError> {
        let mut entries = Vec::with_capacity(profiles.len());
        let mut index = HashMap::with_capacity(profiles.len());
        let mut health = HashMap::with_capacity(profiles.len());

        for profile in profiles {
            if index.contains_key(&profile.id) {
                return Err(ConfigError::DuplicateServer(profile.id.clone()).into());
            }
            let pool = PoolRange::parse(&profile.pool).map_err(|e| ConfigError::InvalidPool {
                server: profile.id.clone(),
                reason: e.to_string(),
            })?;

            index.insert(profile.id.clone(), entries.len());
            health.insert(profile.id.clone(), HealthRecord::new(profile.health));
            entries.push(Entry {
                id: profile.id.clone(),
                name: profile.name.clone(),
                location: profile.location.clone(),
                pool,
            });
        }

        info!("Loaded server directory with {} servers", entries.len());
        Ok(Self {
            entries,
            index,
            health: RwLock::new(health),
        })
    }

    fn entry(&self, id: &str) -> Result<&Entry, DirectoryError> {
        self.index
            .get(id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    fn snapshot(&self, entry: &Entry, health: &HashMap<String, HealthRecord>) -> Server {
        Server {
            id: entry.id.clone(),
            name: entry.name.clone(),
            location: entry.location.clone(),
            health: health.get(&entry.id).map(|h| h.status).unwrap_or_default(),
        }
    }

    /// All servers, in catalog order
    pub fn list(&self) -> Vec<Server> {
        let health = self.health.read().unwrap_or_else(PoisonError::into_inner);
        self.entries.iter().map(|e| self.snapshot(e, &health)).collect()
    }

    /// Look up one server
    pub fn get(&self, id: &str) -> Result<Server, DirectoryError> {
        let entry = self.entry(id)?;
        let health = self.health.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.snapshot(entry, &health))
    }

    /// Current health of one server
    pub fn health_of(&self, id: &str) -> Result<HealthStatus, DirectoryError> {
        self.entry(id)?;
        let health = self.health.read().unwrap_or_else(PoisonError::into_inner);
        Ok(health.get(id).map(|h| h.status).unwrap_or_default())
    }

    /// Full ping record of one server
    pub fn health_record(&self, id: &str) -> Result<HealthRecord, DirectoryError> {
        self.entry(id)?;
        let health = self.health.read().unwrap_or_else(PoisonError::into_inner);
        Ok(health.get(id).cloned().unwrap_or_default())
    }

    /// Address pool of one server
    pub fn pool_of(&self, id: &str) -> Result<PoolRange, DirectoryError> {
        Ok(self.entry(id)?.pool)
    }

    /// `(id, pool)` for every server, in catalog order
    pub fn pools(&self) -> impl Iterator<Item = (&str, PoolRange)> {
        self.entries.iter().map(|e| (e.id.as_str(), e.pool))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn with_record<F>(&self, id: &str, update: F) -> Result<HealthStatus, DirectoryError>
    where
        F: FnOnce(&mut HealthRecord),
    {
        self.entry(id)?;
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        let record = health.entry(id.to_string()).or_default();
        let before = record.status;
        update(record);

        if record.status != before {
            match record.status {
                HealthStatus::Unreachable => warn!("Server {} is now {}", id, record.status),
                _ => info!("Server {} is now {}", id, record.status),
            }
        }
        Ok(record.status)
    }

    /// Record an answered health ping
    pub fn record_success(&self, id: &str, latency_ms: u32) -> Result<HealthStatus, DirectoryError> {
        debug!("Ping ok for {} ({}ms)", id, latency_ms);
        self.with_record(id, |r| r.record_success(latency_ms))
    }

    /// Record an unanswered health ping
    pub fn record_failure(&self, id: &str) -> Result<HealthStatus, DirectoryError> {
        debug!("Ping failed for {}", id);
        self.with_record(id, HealthRecord::record_failure)
    }

    /// Override a server's health (external checker verdict)
    pub fn set_health(&self, id: &str, status: HealthStatus) -> Result<(), DirectoryError> {
        self.with_record(id, |r| r.status = status).map(|_| ())
    }

    /// Healthy server with the lowest known latency
    ///
    /// Servers never pingd rank after pingd ones; ties keep catalog order.
    pub fn best_server(&self) -> Option<Server> {
        let health = self.health.read().unwrap_or_else(PoisonError::into_inner);

        self.entries
            .iter()
            .filter_map(|e| health.get(&e.id).map(|h| (e, h)))
            .filter(|(_, h)| h.status == HealthStatus::Healthy)
            .min_by_key(|(_, h)| h.latency_ms.unwrap_or(u32::MAX))
            .map(|(e, _)| self.snapshot(e, &health))
    }
}

/// Directory errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Invalid catalog: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OjasConfig;

    fn directory() -> ServerDirectory {
        ServerDirectory::from_profiles(&OjasConfig::default_config().servers).unwrap()
    }

    #[test]
    fn test_list_keeps_catalog_order() {
        let dir = directory();
        let ids: Vec<_> = dir.list().into_iter().map(|s| s.id).collect();

        assert_eq!(ids, ["us1", "nl1", "jp1", "sg1", "uk1", "de1", "ca1", "au1"]);
    }

    #[test]
    fn test_get_and_not_found() {
        let dir = directory();

        let jp = dir.get("jp1").unwrap();
        assert_eq!(jp.location, "Tokyo");
        assert_eq!(jp.health, HealthStatus::Healthy);

        assert_eq!(dir.get("xx9"), Err(DirectoryError::NotFound("xx9".into())));
        assert!(dir.health_of("xx9").is_err());
    }

    #[test]
    fn test_pools_are_loaded() {
        let dir = directory();
        assert_eq!(dir.pool_of("de1").unwrap().to_string(), "10.0.6.0/24");
        assert_eq!(dir.pools().count(), 8);
    }

    #[test]
    fn test_failures_mark_unreachable() {
        let dir = directory();

        dir.record_success("sg1", 80).unwrap();
        assert_eq!(dir.record_failure("sg1").unwrap(), HealthStatus::Degraded);
        dir.record_failure("sg1").unwrap();
        assert_eq!(dir.record_failure("sg1").unwrap(), HealthStatus::Unreachable);
        assert_eq!(dir.health_of("sg1").unwrap(), HealthStatus::Unreachable);

        let record = dir.health_record("sg1").unwrap();
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.packet_loss(), 75.0);
    }

    #[test]
    fn test_high_latency_is_degraded() {
        let dir = directory();
        assert_eq!(dir.record_success("au1", 650).unwrap(), HealthStatus::Degraded);
        assert_eq!(dir.record_success("au1", 120).unwrap(), HealthStatus::Healthy);
    }

    #[test]
    fn test_set_health_override() {
        let dir = directory();
        dir.set_health("uk1", HealthStatus::Unreachable).unwrap();

        assert_eq!(dir.get("uk1").unwrap().health, HealthStatus::Unreachable);
        assert!(!HealthStatus::Unreachable.is_usable());
    }

    #[test]
    fn test_best_server() {
        let dir = directory();

        // Nothing pingd: first healthy in catalog order
        assert_eq!(dir.best_server().unwrap().id, "us1");

        dir.record_success("nl1", 40).unwrap();
        dir.record_success("de1", 25).unwrap();
        dir.record_success("us1", 90).unwrap();
        assert_eq!(dir.best_server().unwrap().id, "de1");

        dir.set_health("de1", HealthStatus::Degraded).unwrap();
        assert_eq!(dir.best_server().unwrap().id, "nl1");
    }

    #[test]
    fn test_duplicate_profile_rejected() {
        let mut servers = OjasConfig::default_config().servers;
        servers[2].id = "us1".to_string();

        assert!(matches!(
            ServerDirectory::from_profiles(&servers),
            Err(DirectoryError::Config(ConfigError::DuplicateServer(_)))
        ));
    }
}

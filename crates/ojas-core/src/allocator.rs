//! Virtual Address Allocator
//!
//! Hands out tunnel addresses from each server's private IPv4 pool.
//!
//! Within a pool the network address, the gateway (`.1`, held by the
//! server itself) and the broadcast address are never leased. Draws are
//! deterministic: the lowest free host address wins.
//!
//! Each pool has its own lock, so sessions on different servers never
//! contend with each other.

use crate::directory::ServerDirectory;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Smallest usable pool: network, gateway, one host, broadcast
const MAX_PREFIX: u8 = 30;

/// IPv4 CIDR block backing a server's address pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    net: Ipv4Network,
}

impl PoolRange {
    /// Parse CIDR notation (e.g. "10.0.1.0/24")
    ///
    /// Host bits are masked off; the prefix must be explicit.
    pub fn parse(cidr: &str) -> Result<Self, AllocError> {
        let invalid = || AllocError::InvalidPool(cidr.to_string());

        let cidr_trimmed = cidr.trim();
        if !cidr_trimmed.contains('/') {
            return Err(invalid());
        }
        let net: Ipv4Network = cidr_trimmed.parse().map_err(|_| invalid())?;
        if net.prefix() > MAX_PREFIX {
            return Err(invalid());
        }

        let net = Ipv4Network::new(net.network(), net.prefix()).map_err(|_| invalid())?;
        Ok(Self { net })
    }

    /// Number of addresses in the block
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.net.broadcast())) - u64::from(u32::from(self.net.network())) + 1
    }

    /// Number of leasable host addresses
    pub fn capacity(&self) -> u64 {
        self.size() - 3
    }

    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    /// Broadcast address
    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    /// Gateway address (held by the server)
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.net.network()) + 1)
    }

    pub fn prefix(&self) -> u8 {
        self.net.prefix()
    }

    /// Does the block contain this address?
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(addr)
    }

    /// Do the two blocks share any address?
    pub fn overlaps(&self, other: &PoolRange) -> bool {
        self.net.contains(other.net.network()) || other.net.contains(self.net.network())
    }

    /// Leasable host addresses, lowest first
    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let broadcast = self.net.broadcast();
        self.net.iter().skip(2).take_while(move |addr| *addr != broadcast)
    }
}

impl fmt::Display for PoolRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net.network(), self.net.prefix())
    }
}

/// One server's pool and its outstanding leases
#[derive(Debug)]
struct Pool {
    range: PoolRange,
    leased: BTreeSet<Ipv4Addr>,
}

impl Pool {
    fn new(range: PoolRange) -> Self {
        Self {
            range,
            leased: BTreeSet::new(),
        }
    }

    /// Lowest host address not currently leased
    fn lowest_free(&self) -> Option<Ipv4Addr> {
        self.range.hosts().find(|addr| !self.leased.contains(addr))
    }
}

/// Per-server virtual address pools
#[derive(Debug, Default)]
pub struct AddressAllocator {
    pools: HashMap<String, Mutex<Pool>>,
}

impl AddressAllocator {
    /// Create an allocator with no pools
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's pool
    ///
    /// Registration happens before the allocator is shared; the pool set
    /// is fixed afterwards.
    pub fn register(&mut self, server_id: &str, range: PoolRange) -> Result<(), AllocError> {
        if self.pools.contains_key(server_id) {
            return Err(AllocError::AlreadyRegistered(server_id.to_string()));
        }
        debug!("Registered pool {} for {}", range, server_id);
        self.pools.insert(server_id.to_string(), Mutex::new(Pool::new(range)));
        Ok(())
    }

    /// Build an allocator from `(server id, CIDR)` pairs
    pub fn from_pools<'a, I>(pools: I) -> Result<Self, AllocError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut allocator = Self::new();
        for (server_id, cidr) in pools {
            allocator.register(server_id, PoolRange::parse(cidr)?)?;
        }
        Ok(allocator)
    }

    /// One pool per catalog server
    pub fn from_directory(directory: &ServerDirectory) -> Result<Self, AllocError> {
        let mut allocator = Self::new();
        for (server_id, range) in directory.pools() {
            allocator.register(server_id, range)?;
        }
        Ok(allocator)
    }

    fn pool(&self, server_id: &str) -> Result<&Mutex<Pool>, AllocError> {
        self.pools
            .get(server_id)
            .ok_or_else(|| AllocError::UnknownServer(server_id.to_string()))
    }

    /// Lease the lowest free address in the server's pool
    pub fn allocate(&self, server_id: &str) -> Result<Ipv4Addr, AllocError> {
        let mut pool = self.pool(server_id)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(addr) = pool.lowest_free() else {
            warn!("Address pool {} for {} is exhausted", pool.range, server_id);
            return Err(AllocError::PoolExhausted(server_id.to_string()));
        };

        pool.leased.insert(addr);
        debug!("Leased {} on {} ({} in use)", addr, server_id, pool.leased.len());
        Ok(addr)
    }

    /// Return an address to its pool
    ///
    /// Idempotent: releasing an address that is not leased (or a server
    /// with no pool) does nothing. Returns whether a lease was dropped.
    pub fn release(&self, server_id: &str, addr: Ipv4Addr) -> bool {
        let Ok(pool) = self.pool(server_id) else {
            debug!("Release for unknown pool {} ignored", server_id);
            return false;
        };
        let mut pool = pool.lock().unwrap_or_else(PoisonError::into_inner);

        let released = pool.leased.remove(&addr);
        if released {
            debug!("Released {} on {}", addr, server_id);
        }
        released
    }

    /// Is this address currently leased on the server?
    pub fn is_leased(&self, server_id: &str, addr: Ipv4Addr) -> bool {
        self.pool(server_id)
            .map(|p| {
                p.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .leased
                    .contains(&addr)
            })
            .unwrap_or(false)
    }

    /// Number of outstanding leases on the server
    pub fn leased_count(&self, server_id: &str) -> Result<usize, AllocError> {
        Ok(self.pool(server_id)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .len())
    }

    /// Number of addresses still available on the server
    pub fn available(&self, server_id: &str) -> Result<u64, AllocError> {
        let pool = self.pool(server_id)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(pool.range.capacity() - pool.leased.len() as u64)
    }

    /// The server's pool range
    pub fn range(&self, server_id: &str) -> Result<PoolRange, AllocError> {
        Ok(self.pool(server_id)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range)
    }
}

/// Allocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("No address pool for server {0}")]
    UnknownServer(String),

    #[error("Address pool exhausted for server {0}")]
    PoolExhausted(String),

    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    #[error("Pool already registered for server {0}")]
    AlreadyRegistered(String),
}

//! Tunnel Link
//!
//! The piece that actually brings a tunnel up to a server once the
//! controller has leased an address. The controller runs
//! [`TunnelLink::establish`] outside its state lock, racing it against
//! cancellation and the connect deadline, so a link may take as long as
//! its handshake needs.

use crate::directory::Server;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::debug;

/// Transport collaborator of the session controller
#[async_trait]
pub trait TunnelLink: Send + Sync {
    /// Bring the tunnel up using the leased virtual address
    async fn establish(&self, server: &Server, address: Ipv4Addr) -> Result<(), LinkError>;

    /// Tear the tunnel down; best effort, must not block
    fn teardown(&self, _server_id: &str, _address: Ipv4Addr) {}
}

/// Link that is up as soon as it is asked
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateLink;

#[async_trait]
impl TunnelLink for ImmediateLink {
    async fn establish(&self, server: &Server, address: Ipv4Addr) -> Result<(), LinkError> {
        debug!("Link to {} up immediately ({})", server.id, address);
        Ok(())
    }
}

/// Link whose handshake takes a fixed time
#[derive(Debug, Clone, Copy)]
pub struct DelayedLink {
    handshake: Duration,
}

impl DelayedLink {
    pub fn new(handshake: Duration) -> Self {
        Self { handshake }
    }
}

#[async_trait]
impl TunnelLink for DelayedLink {
    async fn establish(&self, server: &Server, address: Ipv4Addr) -> Result<(), LinkError> {
        debug!("Handshaking with {} for {:?}", server.id, self.handshake);
        tokio::time::sleep(self.handshake).await;
        debug!("Link to {} up ({})", server.id, address);
        Ok(())
    }

    fn teardown(&self, server_id: &str, address: Ipv4Addr) {
        debug!("Link to {} down ({})", server_id, address);
    }
}

/// Link errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Server unreachable: {0}")]
    Unreachable(String),
}

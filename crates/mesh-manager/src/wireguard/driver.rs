//! WireGuard driver capability
//!
//! The reconciler and join path program the local interface exclusively
//! through this trait, so a kernel-backed driver and the in-process test
//! driver interchange.

use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// A WireGuard peer as programmed on the local interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Node id the peer belongs to
    pub id: String,
    /// Peer public key (base64); peers are unique by this key
    pub public_key: String,
    /// Peer endpoint, when publicly reachable
    pub endpoint: Option<SocketAddr>,
    /// Prefixes routed to this peer
    pub allowed_ips: Vec<IpNet>,
}

/// Driver for the local WireGuard interface.
#[async_trait]
pub trait WireGuardDriver: Send + Sync {
    /// Set the interface private key and listen port. Must complete before
    /// the first peer is installed.
    async fn configure(&self, private_key: &str, listen_port: u16) -> Result<()>;

    /// Install or replace a peer. Idempotent; uniqueness is by public key.
    async fn put_peer(&self, peer: &Peer) -> Result<()>;

    /// Remove a peer by public key.
    async fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Route a prefix over the interface. Returns
    /// [`Error::RouteExists`] when the route is already present; callers
    /// treat that as non-fatal.
    async fn add_route(&self, prefix: IpNet) -> Result<()>;

    /// The interface name.
    fn name(&self) -> String;
}

/// In-process driver recording programmed state. Test double for the
/// kernel-backed drivers.
#[derive(Default)]
pub struct MemoryDriver {
    interface: String,
    configured: Mutex<Option<(String, u16)>>,
    peers: DashMap<String, Peer>,
    routes: Mutex<BTreeSet<IpNet>>,
}

impl MemoryDriver {
    /// Create a driver for the named interface.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Default::default()
        }
    }

    /// Snapshot of programmed peers, ordered by public key.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        peers
    }

    /// The programmed peer for a public key, if present.
    pub fn peer(&self, public_key: &str) -> Option<Peer> {
        self.peers.get(public_key).map(|p| p.clone())
    }

    /// Snapshot of programmed routes.
    pub fn routes(&self) -> Vec<IpNet> {
        self.routes.lock().iter().copied().collect()
    }

    /// Whether `configure` has been called.
    pub fn is_configured(&self) -> bool {
        self.configured.lock().is_some()
    }
}

#[async_trait]
impl WireGuardDriver for MemoryDriver {
    async fn configure(&self, private_key: &str, listen_port: u16) -> Result<()> {
        *self.configured.lock() = Some((private_key.to_string(), listen_port));
        Ok(())
    }

    async fn put_peer(&self, peer: &Peer) -> Result<()> {
        if self.configured.lock().is_none() {
            return Err(Error::Driver("interface not configured".to_string()));
        }
        self.peers.insert(peer.public_key.clone(), peer.clone());
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.peers.remove(public_key);
        Ok(())
    }

    async fn add_route(&self, prefix: IpNet) -> Result<()> {
        if !self.routes.lock().insert(prefix) {
            return Err(Error::RouteExists(prefix));
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.interface.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn peer(key: &str) -> Peer {
        Peer {
            id: "node".to_string(),
            public_key: key.to_string(),
            endpoint: None,
            allowed_ips: vec![IpNet::from_str("10.0.0.2/32").unwrap()],
        }
    }

    #[tokio::test]
    async fn test_put_peer_requires_configure() {
        let driver = MemoryDriver::new("wg0");
        assert!(driver.put_peer(&peer("k1")).await.is_err());

        driver.configure("priv", 51820).await.unwrap();
        driver.put_peer(&peer("k1")).await.unwrap();
        assert_eq!(driver.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_put_peer_idempotent() {
        let driver = MemoryDriver::new("wg0");
        driver.configure("priv", 51820).await.unwrap();

        driver.put_peer(&peer("k1")).await.unwrap();
        driver.put_peer(&peer("k1")).await.unwrap();
        assert_eq!(driver.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let driver = MemoryDriver::new("wg0");
        driver.configure("priv", 51820).await.unwrap();
        driver.put_peer(&peer("k1")).await.unwrap();

        driver.remove_peer("k1").await.unwrap();
        assert!(driver.peers().is_empty());
    }

    #[tokio::test]
    async fn test_add_route_sentinel() {
        let driver = MemoryDriver::new("wg0");
        let prefix = IpNet::from_str("10.0.0.0/24").unwrap();

        driver.add_route(prefix).await.unwrap();
        assert!(matches!(
            driver.add_route(prefix).await,
            Err(Error::RouteExists(_))
        ));
    }
}

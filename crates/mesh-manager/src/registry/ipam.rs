//! Address allocation
//!
//! IPv4 leases are computed from the replicated lease set: the allocator
//! scans held leases and emits the lowest free host in the cluster prefix,
//! so any leader derives the same answer from the same state. IPv6 hosts
//! are derived from the cluster ULA and a hash of the node id.

use crate::storage::{keys, MeshStorage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A lease binding an IPv4 host address to a node for the duration of its
/// membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Node holding the lease
    pub node_id: String,
    /// Leased host address (/32)
    pub ipv4: Ipv4Net,
    /// Acquisition timestamp
    pub created_at: DateTime<Utc>,
}

/// IPv4 lease allocator over the replicated lease set.
#[derive(Clone)]
pub struct Ipam {
    storage: Arc<dyn MeshStorage>,
}

impl Ipam {
    /// Create an allocator over the given storage.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// Acquire a lease for `node_id` within `prefix`.
    ///
    /// Returns the existing lease unchanged when the node already holds one.
    /// Otherwise allocates the lowest free host address, skipping the
    /// network and broadcast addresses.
    pub async fn acquire(&self, node_id: &str, prefix: Ipv4Net) -> Result<Lease> {
        let leases = self.leases().await?;
        if let Some(existing) = leases.iter().find(|l| l.node_id == node_id) {
            return Ok(existing.clone());
        }

        // The lease scan returns key order and the lowest free host wins,
        // so every leader derives the same address from the same state.
        let used: BTreeSet<u32> = leases.iter().map(|l| u32::from(l.ipv4.addr())).collect();

        let network = u32::from(prefix.network());
        let broadcast = u32::from(prefix.broadcast());
        let host = ((network + 1)..broadcast)
            .find(|candidate| !used.contains(candidate))
            .ok_or_else(|| Error::NoAvailableAddresses(prefix.to_string()))?;

        let lease = Lease {
            node_id: node_id.to_string(),
            ipv4: Ipv4Net::new(Ipv4Addr::from(host), 32)?,
            created_at: Utc::now(),
        };
        let key = format!("{}{}", keys::LEASES_PREFIX, node_id);
        self.storage
            .put(&key, &serde_json::to_string(&lease)?, Duration::ZERO)
            .await?;
        info!(node_id = %node_id, ipv4 = %lease.ipv4, "acquired lease");
        Ok(lease)
    }

    /// Release the lease held by `node_id`. Missing leases are ignored.
    pub async fn release(&self, node_id: &str) -> Result<()> {
        let key = format!("{}{}", keys::LEASES_PREFIX, node_id);
        match self.storage.delete(&key).await {
            Ok(()) => {
                info!(node_id = %node_id, "released lease");
                Ok(())
            }
            Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All currently held leases.
    pub async fn leases(&self) -> Result<Vec<Lease>> {
        let pairs = self.storage.iter_prefix(keys::LEASES_PREFIX).await?;
        pairs
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(Into::into))
            .collect()
    }
}

/// Derive a node's private IPv6 host address from the cluster ULA.
///
/// The low 64 bits come from a hash of the node id; a nonzero `attempt`
/// salts the hash to step past a collision.
pub fn derive_ipv6(ula: Ipv6Net, node_id: &str, attempt: u32) -> Result<Ipv6Net> {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    if attempt > 0 {
        hasher.update(attempt.to_be_bytes());
    }
    let digest = hasher.finalize();
    let host = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));

    let network = u128::from(ula.network());
    let addr = network | u128::from(host);
    Ok(Ipv6Net::new(addr.into(), 112)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::str::FromStr;

    fn ipam() -> Ipam {
        Ipam::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_sequential_allocation() {
        let ipam = ipam();
        let prefix = Ipv4Net::from_str("10.0.0.0/24").unwrap();

        let a = ipam.acquire("node-a", prefix).await.unwrap();
        let b = ipam.acquire("node-b", prefix).await.unwrap();
        let c = ipam.acquire("node-c", prefix).await.unwrap();

        assert_eq!(a.ipv4.addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(b.ipv4.addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(c.ipv4.addr(), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let ipam = ipam();
        let prefix = Ipv4Net::from_str("10.0.0.0/24").unwrap();

        let first = ipam.acquire("node-a", prefix).await.unwrap();
        let again = ipam.acquire("node-a", prefix).await.unwrap();

        assert_eq!(first.ipv4, again.ipv4);
        assert_eq!(ipam.leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_and_reuse() {
        let ipam = ipam();
        let prefix = Ipv4Net::from_str("10.0.0.0/24").unwrap();

        ipam.acquire("node-a", prefix).await.unwrap();
        let b = ipam.acquire("node-b", prefix).await.unwrap();
        ipam.acquire("node-c", prefix).await.unwrap();

        ipam.release("node-b").await.unwrap();

        // The gap is refilled before any new address is handed out.
        let d = ipam.acquire("node-d", prefix).await.unwrap();
        assert_eq!(d.ipv4.addr(), b.ipv4.addr());
    }

    #[tokio::test]
    async fn test_release_missing_is_noop() {
        let ipam = ipam();
        ipam.release("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let ipam = ipam();
        // /30 has exactly two usable hosts.
        let prefix = Ipv4Net::from_str("10.0.0.0/30").unwrap();

        ipam.acquire("node-a", prefix).await.unwrap();
        ipam.acquire("node-b", prefix).await.unwrap();

        let result = ipam.acquire("node-c", prefix).await;
        assert!(matches!(result, Err(Error::NoAvailableAddresses(_))));
    }

    #[tokio::test]
    async fn test_all_leases_distinct_and_in_prefix() {
        let ipam = ipam();
        let prefix = Ipv4Net::from_str("10.0.0.0/26").unwrap();

        for i in 0..40 {
            ipam.acquire(&format!("node-{:02}", i), prefix).await.unwrap();
        }

        let leases = ipam.leases().await.unwrap();
        let addrs: BTreeSet<_> = leases.iter().map(|l| l.ipv4.addr()).collect();
        assert_eq!(addrs.len(), 40);
        assert!(addrs.iter().all(|a| prefix.contains(a)));
    }

    #[test]
    fn test_derive_ipv6_stable() {
        let ula = Ipv6Net::from_str("fd00:dead:beef::/48").unwrap();

        let a = derive_ipv6(ula, "node-a", 0).unwrap();
        let again = derive_ipv6(ula, "node-a", 0).unwrap();
        assert_eq!(a, again);
        assert_eq!(a.prefix_len(), 112);
        assert!(ula.contains(&a.addr()));

        let b = derive_ipv6(ula, "node-b", 0).unwrap();
        assert_ne!(a.addr(), b.addr());

        let salted = derive_ipv6(ula, "node-a", 1).unwrap();
        assert_ne!(a.addr(), salted.addr());
    }
}

//! Peer registry
//!
//! Typed view over the `peers/`, `asns/`, and `groups/` namespaces. The
//! node index is derived from a prefix scan on every call; change
//! subscriptions in the reconciler amortize the cost.

use crate::models::{Group, MeshNode};
use crate::storage::{keys, MeshStorage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// First ASN handed out by the monotonic assigner. Start of the private
/// 16-bit ASN range.
const ASN_BASE: u32 = 64512;

/// Options for registering a new node.
#[derive(Debug, Clone)]
pub struct CreateNodeOptions {
    /// Unique node identifier
    pub id: String,
    /// WireGuard public key (base64)
    pub public_key: String,
    /// Publicly reachable WireGuard endpoint, if any
    pub endpoint: Option<SocketAddr>,
    /// Private IPv4 address from the node's lease, if IPv4 is enabled
    pub private_ipv4: Option<Ipv4Net>,
    /// Private IPv6 address derived from the cluster ULA
    pub private_ipv6: Option<Ipv6Net>,
    /// Replicated-log listen port
    pub raft_port: u16,
    /// gRPC advertise port
    pub grpc_port: u16,
    /// WireGuard listen port
    pub wireguard_port: u16,
    /// Availability zones
    pub zones: Vec<String>,
    /// Operator-advertised allowed-IP prefixes
    pub allowed_ips: Vec<IpNet>,
    /// Admitting node, absent only for the bootstrap node
    pub admitted_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AsnRecord {
    asn: u32,
    node_id: String,
    created_at: DateTime<Utc>,
}

/// Registry of mesh nodes.
#[derive(Clone)]
pub struct PeerRegistry {
    storage: Arc<dyn MeshStorage>,
}

impl PeerRegistry {
    /// Create a registry view over the given storage.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    fn node_key(id: &str) -> String {
        format!("{}{}", keys::PEERS_PREFIX, id)
    }

    /// Fetch a node by id.
    pub async fn get(&self, id: &str) -> Result<MeshNode> {
        match self.storage.get(&Self::node_key(id)).await {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(Error::KeyNotFound(_)) => Err(Error::NodeNotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Register a new node. Fails when the id is already taken; the
    /// read-check-write runs against the linearizable store and admissions
    /// are serialized on the leader.
    pub async fn create(&self, opts: CreateNodeOptions) -> Result<MeshNode> {
        if opts.id.is_empty() {
            return Err(Error::InvalidArgument("node id required".to_string()));
        }
        match self.get(&opts.id).await {
            Ok(_) => return Err(Error::NodeAlreadyExists(opts.id)),
            Err(Error::NodeNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let node = MeshNode {
            id: opts.id,
            public_key: opts.public_key,
            endpoint: opts.endpoint,
            private_ipv4: opts.private_ipv4,
            private_ipv6: opts.private_ipv6,
            raft_port: opts.raft_port,
            grpc_port: opts.grpc_port,
            wireguard_port: opts.wireguard_port,
            zones: opts.zones,
            allowed_ips: opts.allowed_ips,
            asn: 0,
            admitted_by: opts.admitted_by,
            created_at: now,
            updated_at: now,
        };
        self.persist(&node).await?;
        info!(node_id = %node.id, "registered node");
        Ok(node)
    }

    /// Persist an updated node record.
    pub async fn update(&self, node: &MeshNode) -> Result<MeshNode> {
        // Refuse to resurrect deleted nodes through update.
        self.get(&node.id).await?;
        let mut node = node.clone();
        node.updated_at = Utc::now();
        self.persist(&node).await?;
        Ok(node)
    }

    async fn persist(&self, node: &MeshNode) -> Result<()> {
        self.storage
            .put(
                &Self::node_key(&node.id),
                &serde_json::to_string(node)?,
                Duration::ZERO,
            )
            .await
    }

    /// Remove a node, reclaiming its lease and ASN assignment. A lease
    /// never outlives the node holding it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match self.storage.delete(&Self::node_key(id)).await {
            Ok(()) => {}
            Err(Error::KeyNotFound(_)) => return Err(Error::NodeNotFound(id.to_string())),
            Err(e) => return Err(e),
        }
        for key in [
            format!("{}{}", keys::ASNS_PREFIX, id),
            format!("{}{}", keys::LEASES_PREFIX, id),
        ] {
            match self.storage.delete(&key).await {
                Ok(()) | Err(Error::KeyNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(node_id = %id, "deleted node");
        Ok(())
    }

    /// All registered nodes, in id order.
    pub async fn list(&self) -> Result<Vec<MeshNode>> {
        let pairs = self.storage.iter_prefix(keys::PEERS_PREFIX).await?;
        pairs
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(Into::into))
            .collect()
    }

    /// All registered nodes except `exclude`.
    pub async fn list_peers(&self, exclude: &str) -> Result<Vec<MeshNode>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|n| n.id != exclude)
            .collect())
    }

    /// Assign the next free ASN to a node. Returns the existing assignment
    /// when the node already has one.
    pub async fn assign_asn(&self, id: &str) -> Result<u32> {
        let mut node = self.get(id).await?;
        if node.asn != 0 {
            return Ok(node.asn);
        }

        let pairs = self.storage.iter_prefix(keys::ASNS_PREFIX).await?;
        let max = pairs
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_str::<AsnRecord>(&value).ok())
            .map(|r| r.asn)
            .max()
            .unwrap_or(ASN_BASE - 1);
        let asn = max + 1;

        let record = AsnRecord {
            asn,
            node_id: id.to_string(),
            created_at: Utc::now(),
        };
        let asn_key = format!("{}{}", keys::ASNS_PREFIX, id);
        self.storage
            .put(&asn_key, &serde_json::to_string(&record)?, Duration::ZERO)
            .await?;

        node.asn = asn;
        self.update(&node).await?;
        info!(node_id = %id, asn = asn, "assigned ASN");
        Ok(asn)
    }

    // Group management, used by ACL selector expansion.

    fn group_key(name: &str) -> String {
        format!("{}{}", keys::GROUPS_PREFIX, name)
    }

    /// Create or update a group.
    pub async fn put_group(&self, group: &Group) -> Result<()> {
        if group.name.is_empty() {
            return Err(Error::InvalidArgument("group name required".to_string()));
        }
        self.storage
            .put(
                &Self::group_key(&group.name),
                &serde_json::to_string(group)?,
                Duration::ZERO,
            )
            .await
    }

    /// Fetch a group by name.
    pub async fn get_group(&self, name: &str) -> Result<Group> {
        match self.storage.get(&Self::group_key(name)).await {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(Error::KeyNotFound(_)) => Err(Error::GroupNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Delete a group. Deleting a missing group is a no-op.
    pub async fn delete_group(&self, name: &str) -> Result<()> {
        match self.storage.delete(&Self::group_key(name)).await {
            Ok(()) | Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All groups, in name order.
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let pairs = self.storage.iter_prefix(keys::GROUPS_PREFIX).await?;
        pairs
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(Into::into))
            .collect()
    }
}

//! Mesh node model

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Key of a node record in the registry: the node's opaque identifier.
pub type NodeKey = String;

/// A registered mesh node.
///
/// Nodes are created by the join coordinator on first admission and merged
/// on re-join. `admitted_by` records the node that admitted this one into
/// the mesh; the full set of those references forms the admission DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    /// Unique node identifier
    pub id: NodeKey,
    /// WireGuard public key (base64)
    pub public_key: String,
    /// Publicly reachable WireGuard endpoint, if the node has one
    pub endpoint: Option<SocketAddr>,
    /// Private IPv4 address within the cluster prefix (/32)
    pub private_ipv4: Option<Ipv4Net>,
    /// Private IPv6 address derived from the cluster ULA (/112)
    pub private_ipv6: Option<Ipv6Net>,
    /// Replicated-log listen port
    pub raft_port: u16,
    /// gRPC advertise port
    pub grpc_port: u16,
    /// WireGuard listen port
    pub wireguard_port: u16,
    /// Availability zones the node participates in
    #[serde(default)]
    pub zones: Vec<String>,
    /// Additional allowed-IP prefixes advertised by the operator
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    /// Assigned ASN, zero when unassigned
    #[serde(default)]
    pub asn: u32,
    /// Node that admitted this node into the mesh. Only the bootstrap
    /// node has no admitter.
    pub admitted_by: Option<NodeKey>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl MeshNode {
    /// Whether the node advertises a public endpoint.
    pub fn is_public(&self) -> bool {
        self.endpoint.is_some()
    }

    /// The node's private prefixes, whichever are assigned.
    pub fn private_prefixes(&self) -> Vec<IpNet> {
        let mut prefixes = Vec::with_capacity(2);
        if let Some(v4) = self.private_ipv4 {
            prefixes.push(IpNet::V4(v4));
        }
        if let Some(v6) = self.private_ipv6 {
            prefixes.push(IpNet::V6(v6));
        }
        prefixes
    }
}

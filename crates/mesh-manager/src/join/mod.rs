//! Cluster join
//!
//! The leader-side join coordinator admits nodes into the mesh: it
//! validates the request, allocates addresses, persists the node record,
//! adds the joiner to the replicated log as a non-voter, and returns the
//! bootstrap peer list. The client side drives the join RPC with bounded
//! retries and applies the response to the local interface.

use crate::config::MeshOptions;
use crate::models::MeshNode;
use crate::reconciler::PeerReconciler;
use crate::registry::{derive_ipv6, CreateNodeOptions, Ipam, MeshState, PeerRegistry};
use crate::storage::MeshStorage;
use crate::wireguard::{keys, KeyPair, Peer};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Request to join the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Joining node's id
    pub id: String,
    /// Joining node's WireGuard public key (base64)
    pub public_key: String,
    /// Replicated-log listen port
    pub raft_port: u16,
    /// gRPC advertise port
    pub grpc_port: u16,
    /// WireGuard listen port
    pub wireguard_port: u16,
    /// Publicly reachable WireGuard endpoint, as `ip:port`
    pub public_endpoint: Option<String>,
    /// Request an IPv4 lease
    pub assign_ipv4: bool,
    /// Prefer the IPv6 address for replicated-log traffic
    pub prefer_raft_ipv6: bool,
    /// Request voter membership; admission is as a non-voter regardless
    pub as_voter: bool,
    /// Extra allowed-IP prefixes advertised by the operator
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Availability zones
    #[serde(default)]
    pub available_zones: Vec<String>,
    /// Request an ASN assignment
    pub assign_asn: bool,
}

/// A peer entry in the join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer node id
    pub id: String,
    /// Peer WireGuard public key (base64)
    pub public_key: String,
    /// Peer public endpoint, when set
    pub endpoint: Option<String>,
    /// Peer private IPv4 (/32), when leased
    pub address_ipv4: Option<String>,
    /// Peer private IPv6 (/112)
    pub address_ipv6: Option<String>,
    /// Operator-advertised allowed-IP prefixes
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Peer ASN, zero when unassigned
    pub asn: u32,
}

/// Response to a successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The joiner's assigned IPv6 prefix
    pub network_ipv6: String,
    /// The cluster IPv4 prefix, when IPv4 is enabled
    pub network_ipv4: Option<String>,
    /// The joiner's leased IPv4 address (/32), when requested
    pub address_ipv4: Option<String>,
    /// The joiner's ASN, zero when none was assigned
    pub asn: u32,
    /// All other mesh peers
    pub peers: Vec<PeerInfo>,
}

/// Capability over the replicated-log membership, implemented by the
/// consensus engine outside this crate.
#[async_trait]
pub trait RaftControl: Send + Sync {
    /// Whether this node currently leads the cluster.
    fn is_leader(&self) -> bool;

    /// Add a node to the cluster as a non-voter at the given address.
    async fn add_non_voter(&self, id: &str, addr: SocketAddr) -> Result<()>;
}

/// Transport for the join RPC, implemented by the serving glue outside
/// this crate.
#[async_trait]
pub trait JoinRpc: Send + Sync {
    /// Send a join request to the cluster.
    async fn join(&self, req: &JoinRequest) -> Result<JoinResponse>;
}

/// Leader-side admission of joining nodes.
pub struct JoinCoordinator {
    registry: PeerRegistry,
    ipam: Ipam,
    state: MeshState,
    raft: Arc<dyn RaftControl>,
    /// The leader's own node id, recorded as the joiner's admitter.
    node_id: String,
}

impl JoinCoordinator {
    /// Create a coordinator for the leader `node_id`.
    pub fn new(
        storage: Arc<dyn MeshStorage>,
        raft: Arc<dyn RaftControl>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(storage.clone()),
            ipam: Ipam::new(storage.clone()),
            state: MeshState::new(storage),
            raft,
            node_id: node_id.into(),
        }
    }

    /// Admit a node into the mesh.
    ///
    /// Re-joins with an existing id merge the mutable fields and keep the
    /// node's addresses and lease. New nodes get an IPv6 host derived from
    /// the cluster ULA, an optional IPv4 lease, and an optional ASN.
    pub async fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        if !self.raft.is_leader() {
            return Err(Error::NotLeader);
        }
        let ula = self.state.ula_prefix().await?;

        if req.id.is_empty() {
            return Err(Error::InvalidArgument("node id required".to_string()));
        }
        keys::validate_public_key(&req.public_key)?;
        let endpoint = match req.public_endpoint.as_deref() {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<SocketAddr>()?),
            _ => None,
        };
        let allowed_ips = parse_prefixes(&req.allowed_ips)?;

        let mut node = match self.registry.get(&req.id).await {
            Ok(mut existing) => {
                info!(node_id = %req.id, "node already exists, merging updates");
                existing.public_key = req.public_key.clone();
                existing.endpoint = endpoint;
                existing.raft_port = req.raft_port;
                existing.grpc_port = req.grpc_port;
                existing.wireguard_port = req.wireguard_port;
                existing.allowed_ips = allowed_ips;
                existing.zones = req.available_zones.clone();
                self.registry.update(&existing).await?
            }
            Err(Error::NodeNotFound(_)) => {
                info!(node_id = %req.id, "registering new node");
                let private_ipv6 = self.derive_free_ipv6(ula, &req.id).await?;
                let private_ipv4 = if req.assign_ipv4 {
                    let prefix = self.state.ipv4_prefix().await?;
                    Some(self.ipam.acquire(&req.id, prefix).await?.ipv4)
                } else {
                    None
                };
                self.registry
                    .create(CreateNodeOptions {
                        id: req.id.clone(),
                        public_key: req.public_key.clone(),
                        endpoint,
                        private_ipv4,
                        private_ipv6: Some(private_ipv6),
                        raft_port: req.raft_port,
                        grpc_port: req.grpc_port,
                        wireguard_port: req.wireguard_port,
                        zones: req.available_zones.clone(),
                        allowed_ips,
                        admitted_by: Some(self.node_id.clone()),
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };

        // A node re-joining with IPv4 newly enabled picks up a lease here;
        // an existing lease is returned unchanged.
        if req.assign_ipv4 && node.private_ipv4.is_none() {
            let prefix = self.state.ipv4_prefix().await?;
            let lease = self.ipam.acquire(&req.id, prefix).await?;
            node.private_ipv4 = Some(lease.ipv4);
            node = self.registry.update(&node).await?;
        }

        if req.assign_asn && node.asn == 0 {
            node.asn = self.registry.assign_asn(&req.id).await?;
        }

        // Prefer IPv4 for replicated-log traffic when a lease was granted.
        let raft_addr = match (node.private_ipv4, node.private_ipv6) {
            (Some(v4), _) if req.assign_ipv4 && !req.prefer_raft_ipv6 => {
                SocketAddr::new(IpAddr::V4(v4.addr()), node.raft_port)
            }
            (_, Some(v6)) => SocketAddr::new(IpAddr::V6(v6.addr()), node.raft_port),
            (Some(v4), None) => SocketAddr::new(IpAddr::V4(v4.addr()), node.raft_port),
            (None, None) => {
                return Err(Error::Internal(format!(
                    "node {} has no private address",
                    node.id
                )))
            }
        };
        info!(node_id = %req.id, raft_addr = %raft_addr, "adding non-voter to cluster");
        self.raft.add_non_voter(&req.id, raft_addr).await?;

        let peers = self
            .registry
            .list_peers(&req.id)
            .await?
            .into_iter()
            .map(peer_info)
            .collect();

        Ok(JoinResponse {
            network_ipv6: node
                .private_ipv6
                .map(|p| p.to_string())
                .unwrap_or_default(),
            network_ipv4: self.state.ipv4_prefix().await.ok().map(|p| p.to_string()),
            address_ipv4: node.private_ipv4.map(|p| p.to_string()),
            asn: node.asn,
            peers,
        })
    }

    /// Derive an IPv6 host for the node, stepping past hash collisions
    /// with a salted retry.
    async fn derive_free_ipv6(
        &self,
        ula: ipnet::Ipv6Net,
        node_id: &str,
    ) -> Result<ipnet::Ipv6Net> {
        let taken: BTreeSet<_> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter_map(|n| n.private_ipv6.map(|p| p.addr()))
            .collect();
        for attempt in 0.. {
            let candidate = derive_ipv6(ula, node_id, attempt)?;
            if !taken.contains(&candidate.addr()) {
                return Ok(candidate);
            }
        }
        unreachable!("ipv6 derivation retries are unbounded")
    }
}

fn peer_info(node: MeshNode) -> PeerInfo {
    PeerInfo {
        id: node.id.clone(),
        public_key: node.public_key.clone(),
        endpoint: node.endpoint.map(|e| e.to_string()),
        address_ipv4: node.private_ipv4.map(|p| p.to_string()),
        address_ipv6: node.private_ipv6.map(|p| p.to_string()),
        allowed_ips: node.allowed_ips.iter().map(|p| p.to_string()).collect(),
        asn: node.asn,
    }
}

fn parse_prefixes(raw: &[String]) -> Result<Vec<IpNet>> {
    raw.iter().map(|s| s.parse().map_err(Error::from)).collect()
}

/// Drive a join against the cluster and apply the response locally.
///
/// Retries up to `max_join_retries` times with one-second sleeps; any
/// error other than cancellation is retryable. On success the interface is
/// configured before any peer is installed, cluster routes are added
/// (existing routes are fine), and the bootstrap peer list is installed
/// through the reconciler's task group.
pub async fn join_cluster(
    rpc: &dyn JoinRpc,
    reconciler: &PeerReconciler,
    key: &KeyPair,
    opts: &MeshOptions,
) -> Result<JoinResponse> {
    let req = JoinRequest {
        id: opts.node_id.clone(),
        public_key: key.public_key_base64(),
        raft_port: opts.raft_port,
        grpc_port: opts.grpc_port,
        wireguard_port: opts.listen_port,
        public_endpoint: opts.endpoint.map(|e| e.to_string()),
        assign_ipv4: !opts.no_ipv4,
        prefer_raft_ipv6: opts.prefer_raft_ipv6,
        as_voter: opts.join_as_voter,
        allowed_ips: opts.allowed_ips.iter().map(|p| p.to_string()).collect(),
        available_zones: opts.zones.clone(),
        assign_asn: opts.assign_asn,
    };

    let mut tries = 0u32;
    let resp = loop {
        if tries > 0 {
            info!(tries, "retrying join request");
        }
        match rpc.join(&req).await {
            Ok(resp) => break resp,
            Err(e) if e.is_retryable() && tries < opts.max_join_retries => {
                warn!(error = %e, "join request failed");
                tries += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    };

    let mut cluster_networks = Vec::new();
    if let Some(v4) = &resp.network_ipv4 {
        if !opts.no_ipv4 {
            cluster_networks.push(v4.parse::<IpNet>()?);
        }
    }
    if !resp.network_ipv6.is_empty() {
        cluster_networks.push(resp.network_ipv6.parse::<IpNet>()?);
    }
    reconciler
        .configure(&key.private_key_base64(), opts.listen_port, &cluster_networks)
        .await?;

    let peers = resp
        .peers
        .iter()
        .map(driver_peer)
        .collect::<Result<Vec<_>>>()?;
    reconciler.apply_peers(peers).await?;

    Ok(resp)
}

fn driver_peer(info: &PeerInfo) -> Result<Peer> {
    let endpoint = match info.endpoint.as_deref() {
        Some(raw) if !raw.is_empty() => Some(raw.parse::<SocketAddr>()?),
        _ => None,
    };
    let mut allowed_ips = Vec::new();
    if let Some(v4) = &info.address_ipv4 {
        allowed_ips.push(v4.parse::<IpNet>()?);
    }
    if let Some(v6) = &info.address_ipv6 {
        allowed_ips.push(v6.parse::<IpNet>()?);
    }
    for extra in &info.allowed_ips {
        allowed_ips.push(extra.parse::<IpNet>()?);
    }
    Ok(Peer {
        id: info.id.clone(),
        public_key: info.public_key.clone(),
        endpoint,
        allowed_ips,
    })
}

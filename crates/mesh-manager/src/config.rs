//! Mesh node options

use crate::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::SocketAddr;

/// Default WireGuard listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Default WireGuard interface name.
pub const DEFAULT_INTERFACE: &str = "wgmesh0";

/// Options for opening a mesh node.
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// This node's unique id
    pub node_id: String,
    /// WireGuard interface name
    pub interface: String,
    /// WireGuard listen port
    pub listen_port: u16,
    /// Publicly reachable WireGuard endpoint, when the node has one
    pub endpoint: Option<SocketAddr>,
    /// Replicated-log listen port
    pub raft_port: u16,
    /// gRPC advertise port
    pub grpc_port: u16,
    /// Availability zones this node participates in
    pub zones: Vec<String>,
    /// Extra allowed-IP prefixes to advertise
    pub allowed_ips: Vec<IpNet>,
    /// Skip IPv4 lease assignment
    pub no_ipv4: bool,
    /// Prefer the IPv6 address for replicated-log traffic
    pub prefer_raft_ipv6: bool,
    /// Request voter membership on join
    pub join_as_voter: bool,
    /// Request an ASN on join
    pub assign_asn: bool,
    /// Join attempts before giving up
    pub max_join_retries: u32,
    /// Bootstrap a new cluster instead of joining one
    pub bootstrap: Option<BootstrapOptions>,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            interface: DEFAULT_INTERFACE.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            endpoint: None,
            raft_port: 9443,
            grpc_port: 8443,
            zones: Vec::new(),
            allowed_ips: Vec::new(),
            no_ipv4: false,
            prefer_raft_ipv6: false,
            join_as_voter: false,
            assign_asn: false,
            max_join_retries: 10,
            bootstrap: None,
        }
    }
}

impl MeshOptions {
    /// Options for a node with the given id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Validate the options before use.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidArgument("node id required".to_string()));
        }
        if self.interface.is_empty() {
            return Err(Error::InvalidArgument("interface name required".to_string()));
        }
        if self.listen_port == 0 {
            return Err(Error::InvalidArgument("listen port required".to_string()));
        }
        if let Some(bootstrap) = &self.bootstrap {
            if self.no_ipv4 && bootstrap.ipv4_prefix.is_some() {
                return Err(Error::InvalidArgument(
                    "ipv4 prefix set with ipv4 disabled".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Options for bootstrapping a new cluster.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Cluster IPv4 prefix. Defaults to `172.16.0.0/12` when IPv4 is
    /// enabled and no prefix is given.
    pub ipv4_prefix: Option<Ipv4Net>,
    /// Cluster ULA prefix. Generated at random within `fd00::/8` when not
    /// given.
    pub ula_prefix: Option<Ipv6Net>,
}

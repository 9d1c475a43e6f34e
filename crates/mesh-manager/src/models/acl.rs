//! Network ACL models

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Wildcard selector matching any value.
pub const WILDCARD: &str = "*";

/// Prefix marking a node selector as a group reference.
pub const GROUP_REFERENCE: &str = "group:";

/// Verdict of a matching ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    /// Allow the matched traffic
    Accept,
    /// Reject the matched traffic
    Deny,
}

/// A network ACL.
///
/// ACLs are evaluated in ascending `priority` order (ties broken by name);
/// the first ACL whose selectors all match decides the verdict. An empty
/// selector set is a wildcard, as is a set containing the literal `*`.
/// Node selectors may reference groups with the `group:` prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAcl {
    /// Unique ACL name
    pub name: String,
    /// Evaluation priority, lower evaluated first
    pub priority: i32,
    /// Verdict when this ACL matches
    pub action: AclAction,
    /// Source node selectors
    #[serde(default)]
    pub source_nodes: Vec<String>,
    /// Destination node selectors
    #[serde(default)]
    pub destination_nodes: Vec<String>,
    /// Source CIDR selectors
    #[serde(default)]
    pub source_cidrs: Vec<String>,
    /// Destination CIDR selectors
    #[serde(default)]
    pub destination_cidrs: Vec<String>,
    /// Protocol selectors
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Port selectors
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl NetworkAcl {
    /// Create an ACL with wildcard selectors.
    pub fn new(name: impl Into<String>, priority: i32, action: AclAction) -> Self {
        Self {
            name: name.into(),
            priority,
            action,
            source_nodes: Vec::new(),
            destination_nodes: Vec::new(),
            source_cidrs: Vec::new(),
            destination_cidrs: Vec::new(),
            protocols: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Set source node selectors.
    pub fn with_source_nodes(mut self, nodes: Vec<String>) -> Self {
        self.source_nodes = nodes;
        self
    }

    /// Set destination node selectors.
    pub fn with_destination_nodes(mut self, nodes: Vec<String>) -> Self {
        self.destination_nodes = nodes;
        self
    }

    /// Set source CIDR selectors.
    pub fn with_source_cidrs(mut self, cidrs: Vec<String>) -> Self {
        self.source_cidrs = cidrs;
        self
    }

    /// Set destination CIDR selectors.
    pub fn with_destination_cidrs(mut self, cidrs: Vec<String>) -> Self {
        self.destination_cidrs = cidrs;
        self
    }
}

/// A concrete traffic tuple evaluated against the ACL set.
#[derive(Debug, Clone, Default)]
pub struct NetworkAction {
    /// Source node id
    pub src_node: String,
    /// Source prefix, when known
    pub src_cidr: Option<IpNet>,
    /// Destination node id
    pub dst_node: String,
    /// Destination prefix, when known
    pub dst_cidr: Option<IpNet>,
    /// Protocol, when known
    pub protocol: Option<String>,
    /// Port, when known
    pub port: Option<u16>,
}

/// A named set of mesh nodes referenced by ACL selectors.
///
/// Members may themselves be `group:` references; cycles are rejected when
/// the referencing ACL is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique group name
    pub name: String,
    /// Member node ids or nested `group:` references
    #[serde(default)]
    pub nodes: Vec<String>,
}

//! Route models

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A route advertisement.
///
/// Declares that `node` can forward traffic destined to `destination_cidrs`
/// on behalf of the mesh. Advertised routes are subject to ACL evaluation
/// when the graph is filtered for an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Unique route name
    pub name: String,
    /// Node advertising the route
    pub node: String,
    /// Destination prefixes the node can forward to
    pub destination_cidrs: Vec<IpNet>,
}

impl Route {
    /// Create a route advertisement.
    pub fn new(name: impl Into<String>, node: impl Into<String>, cidrs: Vec<IpNet>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            destination_cidrs: cidrs,
        }
    }
}

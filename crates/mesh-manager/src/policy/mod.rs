//! Network policy
//!
//! CRUD interfaces to the replicated ACL and route records, plus the graph
//! filter that applies them for a local observer. ACLs are validated when
//! written; evaluation never skips a malformed record because none can be
//! persisted.

mod engine;
mod filter;

pub use engine::{validate_acl, AclList};

use crate::graph::{AdjacencyMap, MeshGraph};
use crate::models::{Group, NetworkAcl, Route};
use crate::storage::{keys, MeshStorage};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Interface to the replicated network policy records.
#[derive(Clone)]
pub struct Networking {
    storage: Arc<dyn MeshStorage>,
}

impl Networking {
    /// Create a policy view over the given storage.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    fn acl_key(name: &str) -> String {
        format!("{}{}", keys::NETWORK_ACLS_PREFIX, name)
    }

    fn route_key(name: &str) -> String {
        format!("{}{}", keys::ROUTES_PREFIX, name)
    }

    /// Create or update a network ACL. Malformed ACLs are rejected here.
    pub async fn put_network_acl(&self, acl: &NetworkAcl) -> Result<()> {
        let groups = self.load_groups().await?;
        validate_acl(acl, &groups)?;
        self.storage
            .put(
                &Self::acl_key(&acl.name),
                &serde_json::to_string(acl)?,
                Duration::ZERO,
            )
            .await?;
        info!(acl = %acl.name, priority = acl.priority, "stored network acl");
        Ok(())
    }

    /// Fetch an ACL by name.
    pub async fn get_network_acl(&self, name: &str) -> Result<NetworkAcl> {
        match self.storage.get(&Self::acl_key(name)).await {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(Error::KeyNotFound(_)) => Err(Error::AclNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Delete an ACL by name. Deleting a missing ACL is a no-op.
    pub async fn delete_network_acl(&self, name: &str) -> Result<()> {
        match self.storage.delete(&Self::acl_key(name)).await {
            Ok(()) | Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All ACLs, in name order.
    pub async fn list_network_acls(&self) -> Result<Vec<NetworkAcl>> {
        let pairs = self.storage.iter_prefix(keys::NETWORK_ACLS_PREFIX).await?;
        pairs
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(Into::into))
            .collect()
    }

    /// Create or update a route advertisement.
    pub async fn put_route(&self, route: &Route) -> Result<()> {
        if route.name.is_empty() {
            return Err(Error::InvalidArgument("route name required".to_string()));
        }
        if route.destination_cidrs.is_empty() {
            return Err(Error::InvalidArgument(
                "route requires at least one destination".to_string(),
            ));
        }
        let node_key = format!("{}{}", keys::PEERS_PREFIX, route.node);
        match self.storage.get(&node_key).await {
            Ok(_) => {}
            Err(Error::KeyNotFound(_)) => {
                return Err(Error::NodeNotFound(route.node.clone()))
            }
            Err(e) => return Err(e),
        }
        self.storage
            .put(
                &Self::route_key(&route.name),
                &serde_json::to_string(route)?,
                Duration::ZERO,
            )
            .await?;
        info!(route = %route.name, node = %route.node, "stored route");
        Ok(())
    }

    /// Fetch a route by name.
    pub async fn get_route(&self, name: &str) -> Result<Route> {
        match self.storage.get(&Self::route_key(name)).await {
            Ok(value) => Ok(serde_json::from_str(&value)?),
            Err(Error::KeyNotFound(_)) => Err(Error::RouteNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Delete a route by name. Deleting a missing route is a no-op.
    pub async fn delete_route(&self, name: &str) -> Result<()> {
        match self.storage.delete(&Self::route_key(name)).await {
            Ok(()) | Err(Error::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All routes, in name order.
    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        let pairs = self.storage.iter_prefix(keys::ROUTES_PREFIX).await?;
        pairs
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(Into::into))
            .collect()
    }

    /// Routes advertised by a given node.
    pub async fn routes_by_node(&self, node: &str) -> Result<Vec<Route>> {
        Ok(self
            .list_routes()
            .await?
            .into_iter()
            .filter(|r| r.node == node)
            .collect())
    }

    /// Routes advertising a destination that contains the given prefix.
    pub async fn routes_by_cidr(&self, cidr: ipnet::IpNet) -> Result<Vec<Route>> {
        Ok(self
            .list_routes()
            .await?
            .into_iter()
            .filter(|r| r.destination_cidrs.iter().any(|d| d.contains(&cidr)))
            .collect())
    }

    /// Filter the graph's own adjacency map for `observer` according to
    /// the current ACLs and routes. An empty ACL set yields an empty map.
    pub async fn filter_graph(
        &self,
        graph: &MeshGraph,
        observer: &str,
    ) -> Result<AdjacencyMap> {
        self.filter_adjacency(graph, graph.adjacency_map(), observer)
            .await
    }

    /// Filter an adjacency map over the graph's vertices for `observer`.
    /// The map may be a previous filter result.
    pub async fn filter_adjacency(
        &self,
        graph: &MeshGraph,
        map: &AdjacencyMap,
        observer: &str,
    ) -> Result<AdjacencyMap> {
        let acls = self.list_network_acls().await?;
        let mut acls = AclList::new(acls);
        if !acls.is_empty() {
            let groups = self.load_groups().await?;
            acls.expand(&groups)?;
        }

        let mut routes_by_node: BTreeMap<String, Vec<Route>> = BTreeMap::new();
        for route in self.list_routes().await? {
            routes_by_node.entry(route.node.clone()).or_default().push(route);
        }

        filter::filter_adjacency(graph, map, &acls, &routes_by_node, observer)
    }

    async fn load_groups(&self) -> Result<BTreeMap<String, Group>> {
        let pairs = self.storage.iter_prefix(keys::GROUPS_PREFIX).await?;
        let mut groups = BTreeMap::new();
        for (_, value) in pairs {
            let group: Group = serde_json::from_str(&value)?;
            groups.insert(group.name.clone(), group);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AclAction;
    use crate::registry::{CreateNodeOptions, PeerRegistry};
    use crate::storage::MemoryStorage;
    use ipnet::{IpNet, Ipv4Net};
    use std::str::FromStr;

    struct Fixture {
        registry: PeerRegistry,
        networking: Networking,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn MeshStorage> = Arc::new(MemoryStorage::new());
        Fixture {
            registry: PeerRegistry::new(storage.clone()),
            networking: Networking::new(storage),
        }
    }

    async fn add_node(f: &Fixture, id: &str, host: u8, admitted_by: Option<&str>) {
        f.registry
            .create(CreateNodeOptions {
                id: id.to_string(),
                public_key: format!("{}-key", id),
                endpoint: None,
                private_ipv4: Some(
                    Ipv4Net::from_str(&format!("10.0.0.{}/32", host)).unwrap(),
                ),
                private_ipv6: None,
                raft_port: 9443,
                grpc_port: 8443,
                wireguard_port: 51820,
                zones: Vec::new(),
                allowed_ips: Vec::new(),
                admitted_by: admitted_by.map(str::to_string),
            })
            .await
            .unwrap();
    }

    fn allow_all() -> NetworkAcl {
        NetworkAcl::new("allow-all", 100, AclAction::Accept)
    }

    #[tokio::test]
    async fn test_acl_crud() {
        let f = fixture();

        f.networking.put_network_acl(&allow_all()).await.unwrap();
        let fetched = f.networking.get_network_acl("allow-all").await.unwrap();
        assert_eq!(fetched.action, AclAction::Accept);

        f.networking.delete_network_acl("allow-all").await.unwrap();
        assert!(matches!(
            f.networking.get_network_acl("allow-all").await,
            Err(Error::AclNotFound(_))
        ));
        // Deleting again is a no-op.
        f.networking.delete_network_acl("allow-all").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_acl_rejected_at_write() {
        let f = fixture();
        let bad = NetworkAcl::new("bad", 0, AclAction::Accept)
            .with_source_cidrs(vec!["10.0.0.0/abc".to_string()]);
        assert!(matches!(
            f.networking.put_network_acl(&bad).await,
            Err(Error::InvalidAcl(_))
        ));
        assert!(f.networking.list_network_acls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_requires_existing_node() {
        let f = fixture();
        let route = Route::new(
            "lan",
            "ghost",
            vec![IpNet::from_str("192.168.0.0/24").unwrap()],
        );
        assert!(matches!(
            f.networking.put_route(&route).await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_routes_by_node_and_cidr() {
        let f = fixture();
        add_node(&f, "d", 4, None).await;

        let route = Route::new(
            "lan-via-d",
            "d",
            vec![IpNet::from_str("192.168.10.0/24").unwrap()],
        );
        f.networking.put_route(&route).await.unwrap();

        assert_eq!(f.networking.routes_by_node("d").await.unwrap().len(), 1);
        assert!(f.networking.routes_by_node("x").await.unwrap().is_empty());

        let hits = f
            .networking
            .routes_by_cidr(IpNet::from_str("192.168.10.128/25").unwrap())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = f
            .networking
            .routes_by_cidr(IpNet::from_str("10.0.0.0/8").unwrap())
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_filter_empty_acls_is_empty_map() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let filtered = f.networking.filter_graph(&graph, "a").await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_filter_allow_all_keeps_graph() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        add_node(&f, "c", 3, Some("b")).await;
        f.networking.put_network_acl(&allow_all()).await.unwrap();

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let filtered = f.networking.filter_graph(&graph, "a").await.unwrap();

        assert!(filtered["a"].contains_key("b"));
        assert!(filtered["b"].contains_key("c"));
        assert!(filtered.contains_key("c"));
    }

    #[tokio::test]
    async fn test_filter_denied_node_dropped() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        add_node(&f, "c", 3, Some("b")).await;
        f.networking.put_network_acl(&allow_all()).await.unwrap();
        let deny = NetworkAcl::new("deny-c", 0, AclAction::Deny)
            .with_source_nodes(vec!["*".to_string()])
            .with_destination_nodes(vec!["c".to_string()]);
        f.networking.put_network_acl(&deny).await.unwrap();

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let filtered = f.networking.filter_graph(&graph, "a").await.unwrap();

        assert!(filtered["a"].contains_key("b"));
        assert!(!filtered.contains_key("c"));
        assert!(!filtered["b"].contains_key("c"));
    }

    #[tokio::test]
    async fn test_filter_observer_row_always_present() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        // Deny everything; the observer row remains, empty.
        let deny = NetworkAcl::new("deny-all", 0, AclAction::Deny);
        f.networking.put_network_acl(&deny).await.unwrap();

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let filtered = f.networking.filter_graph(&graph, "a").await.unwrap();
        assert!(filtered.get("a").is_some());
        assert!(filtered["a"].is_empty());
    }

    #[tokio::test]
    async fn test_filter_route_denial_drops_whole_node() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "d", 4, Some("a")).await;
        f.networking.put_network_acl(&allow_all()).await.unwrap();
        let deny_lan = NetworkAcl::new("deny-lan", 0, AclAction::Deny)
            .with_destination_cidrs(vec!["192.168.10.0/24".to_string()]);
        f.networking.put_network_acl(&deny_lan).await.unwrap();
        let route = Route::new(
            "lan-via-d",
            "d",
            vec![
                IpNet::from_str("192.168.10.0/24").unwrap(),
                IpNet::from_str("192.168.20.0/24").unwrap(),
            ],
        );
        f.networking.put_route(&route).await.unwrap();

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let filtered = f.networking.filter_graph(&graph, "a").await.unwrap();

        // One denied route CIDR removes the node entirely, even though the
        // second advertised CIDR would have been allowed.
        assert!(!filtered.contains_key("d"));
        assert!(filtered["a"].is_empty());
    }

    #[tokio::test]
    async fn test_filter_is_idempotent_on_retained_set() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        add_node(&f, "c", 3, Some("b")).await;
        f.networking.put_network_acl(&allow_all()).await.unwrap();

        let graph = MeshGraph::build(&f.registry).await.unwrap();
        let once = f.networking.filter_graph(&graph, "a").await.unwrap();
        let twice = f.networking.filter_graph(&graph, "a").await.unwrap();
        assert_eq!(once, twice);
    }
}

//! Peer reconciliation
//!
//! Derives the local WireGuard peer set from the policy-filtered admission
//! graph and converges the driver onto it. Reconciles are serialized with
//! interface configuration through a single mutex, so a configure and a
//! reconcile can never interleave.

use crate::graph::MeshGraph;
use crate::policy::Networking;
use crate::registry::PeerRegistry;
use crate::storage::{keys, MeshStorage, SubscriptionHandle};
use crate::wireguard::{Peer, WireGuardDriver};
use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Reconciler for the local node's WireGuard peer table.
pub struct PeerReconciler {
    storage: Arc<dyn MeshStorage>,
    registry: PeerRegistry,
    networking: Networking,
    driver: Arc<dyn WireGuardDriver>,
    node_id: String,
    /// Serializes interface configuration and reconciliation.
    wgmux: tokio::sync::Mutex<()>,
    /// Peer set from the last successful reconcile, keyed by public key.
    /// Owned by the reconciler; used only for the removal diff.
    previous: parking_lot::Mutex<HashMap<String, Peer>>,
}

impl PeerReconciler {
    /// Create a reconciler for `node_id` over the given storage and driver.
    pub fn new(
        storage: Arc<dyn MeshStorage>,
        driver: Arc<dyn WireGuardDriver>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(storage.clone()),
            networking: Networking::new(storage.clone()),
            storage,
            driver,
            node_id: node_id.into(),
            wgmux: tokio::sync::Mutex::new(()),
            previous: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// The node this reconciler derives peers for.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set the interface key and listen port and install cluster routes.
    /// Holds the WireGuard mutex for the whole call; `Mesh::open` invokes
    /// this before the first reconcile.
    pub async fn configure(
        &self,
        private_key: &str,
        listen_port: u16,
        cluster_networks: &[IpNet],
    ) -> Result<()> {
        let _guard = self.wgmux.lock().await;
        info!(interface = %self.driver.name(), listen_port, "configuring wireguard interface");
        self.driver.configure(private_key, listen_port).await?;
        for network in cluster_networks {
            match self.driver.add_route(*network).await {
                Ok(()) => {}
                Err(Error::RouteExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Install a peer set handed over out-of-band, e.g. the bootstrap list
    /// from a join response. Peers are dispatched concurrently; the first
    /// failure cancels the remaining installs and fails the call.
    pub async fn apply_peers(&self, peers: Vec<Peer>) -> Result<()> {
        let _guard = self.wgmux.lock().await;
        self.dispatch_put_peers(&peers).await?;
        let mut previous = self.previous.lock();
        for peer in peers {
            previous.insert(peer.public_key.clone(), peer);
        }
        Ok(())
    }

    /// Re-derive the local peer set and converge the driver onto it.
    ///
    /// A graph build failure is returned to the caller. A failure during
    /// the walk itself is logged and swallowed; reconcile failures are
    /// transient and the next subscription event retries.
    pub async fn refresh_peers(&self) -> Result<()> {
        let _guard = self.wgmux.lock().await;
        let graph = match MeshGraph::build(&self.registry).await {
            Ok(graph) => graph,
            Err(e) => {
                error!(error = %e, "build mesh graph");
                return Err(e);
            }
        };
        if let Err(e) = self.walk_descendants(&graph).await {
            error!(error = %e, "walk mesh descendants");
        }
        Ok(())
    }

    async fn walk_descendants(&self, graph: &MeshGraph) -> Result<()> {
        let filtered = self
            .networking
            .filter_graph(graph, &self.node_id)
            .await?;
        debug!(node_id = %self.node_id, descendants = ?filtered.get(&self.node_id).map(|d| d.len()), "filtered adjacency map");

        let direct = filtered.get(&self.node_id).cloned().unwrap_or_default();

        let mut desired: HashMap<String, Peer> = HashMap::new();
        for (descendant_id, edge) in &direct {
            let Some(descendant) = graph.vertex(descendant_id) else {
                continue;
            };
            // Each direct descendant is a wireguard peer.
            let mut peer = Peer {
                id: descendant.id.clone(),
                public_key: descendant.public_key.clone(),
                endpoint: descendant.endpoint,
                allowed_ips: descendant.private_prefixes(),
            };
            // Grand-descendants are reached through their parent: their
            // private prefixes ride on the parent's allowed-ips.
            if let Some(targets) = filtered.get(&edge.target) {
                for target_id in targets.keys() {
                    if direct.contains_key(target_id) || target_id == &self.node_id {
                        continue;
                    }
                    if let Some(target) = graph.vertex(target_id) {
                        peer.allowed_ips.extend(target.private_prefixes());
                    }
                }
            }
            debug!(
                descendant = %descendant.id,
                allowed_ips = ?peer.allowed_ips,
                "allowed ips for descendant"
            );
            desired.insert(peer.public_key.clone(), peer);
        }

        self.dispatch_put_peers(&desired.values().cloned().collect::<Vec<_>>())
            .await?;

        // Remove peers that fell out of the derived set.
        let stale: Vec<String> = {
            let previous = self.previous.lock();
            previous
                .keys()
                .filter(|key| !desired.contains_key(*key))
                .cloned()
                .collect()
        };
        for public_key in stale {
            debug!(public_key = %public_key, "removing stale peer");
            self.driver.remove_peer(&public_key).await?;
        }

        *self.previous.lock() = desired;
        Ok(())
    }

    /// Push peers to the driver in parallel. The task group completes when
    /// every put has returned; the first failure aborts the siblings and is
    /// returned, leaving any partial updates for the next reconcile.
    async fn dispatch_put_peers(&self, peers: &[Peer]) -> Result<()> {
        let mut group: JoinSet<Result<()>> = JoinSet::new();
        for peer in peers.iter().cloned() {
            let driver = self.driver.clone();
            group.spawn(async move { driver.put_peer(&peer).await });
        }
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Driver(format!("put peer task: {}", e))),
            }
        }
        Ok(())
    }

    /// Subscribe to membership and policy changes; every event enqueues one
    /// reconciliation, drained by a single worker task.
    pub fn watch(self: &Arc<Self>) -> Vec<SubscriptionHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handles = [
            keys::PEERS_PREFIX,
            keys::NETWORK_ACLS_PREFIX,
            keys::ROUTES_PREFIX,
        ]
        .into_iter()
        .map(|prefix| {
            let tx = tx.clone();
            self.storage.subscribe(
                prefix,
                Arc::new(move |event| {
                    let _ = tx.send(event.key().to_string());
                }),
            )
        })
        .collect();
        drop(tx);

        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                debug!(key = %key, "change triggered reconciliation");
                if let Err(e) = reconciler.refresh_peers().await {
                    warn!(error = %e, "reconciliation failed, awaiting next trigger");
                }
            }
        });
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AclAction, NetworkAcl};
    use crate::registry::CreateNodeOptions;
    use crate::storage::MemoryStorage;
    use crate::wireguard::MemoryDriver;
    use ipnet::Ipv4Net;
    use std::str::FromStr;
    use std::time::Duration;

    struct Fixture {
        storage: Arc<dyn MeshStorage>,
        registry: PeerRegistry,
        networking: Networking,
        driver: Arc<MemoryDriver>,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn MeshStorage> = Arc::new(MemoryStorage::new());
        Fixture {
            registry: PeerRegistry::new(storage.clone()),
            networking: Networking::new(storage.clone()),
            driver: Arc::new(MemoryDriver::new("wg0")),
            storage,
        }
    }

    fn reconciler(f: &Fixture, node_id: &str) -> Arc<PeerReconciler> {
        Arc::new(PeerReconciler::new(
            f.storage.clone(),
            f.driver.clone(),
            node_id,
        ))
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

    async fn allow_all(f: &Fixture) {
        f.networking
            .put_network_acl(&NetworkAcl::new("allow-all", 100, AclAction::Accept))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_chain_transitive() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        add_node(&f, "c", 3, Some("b")).await;
        allow_all(&f).await;

        let reconciler = reconciler(&f, "a");
        reconciler.configure("priv", 51820, &[]).await.unwrap();
        reconciler.refresh_peers().await.unwrap();

        let peers = f.driver.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "b-key");
        // Traffic for the grand-descendant flows through its parent.
        let ips: Vec<String> = peers[0].allowed_ips.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.2/32", "10.0.0.3/32"]);
    }

    #[tokio::test]
    async fn test_reconcile_removes_stale_peers() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        add_node(&f, "b", 2, Some("a")).await;
        allow_all(&f).await;

        let reconciler = reconciler(&f, "a");
        reconciler.configure("priv", 51820, &[]).await.unwrap();
        reconciler.refresh_peers().await.unwrap();
        assert_eq!(f.driver.peers().len(), 1);

        f.registry.delete("b").await.unwrap();
        reconciler.refresh_peers().await.unwrap();
        assert!(f.driver.peers().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_deterministic() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        for (i, id) in ["b", "c", "d"].iter().enumerate() {
            add_node(&f, id, (i + 2) as u8, Some("a")).await;
        }
        allow_all(&f).await;

        let reconciler = reconciler(&f, "a");
        reconciler.configure("priv", 51820, &[]).await.unwrap();

        reconciler.refresh_peers().await.unwrap();
        let first = f.driver.peers();
        reconciler.refresh_peers().await.unwrap();
        let second = f.driver.peers();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_walk_failure_is_swallowed() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        allow_all(&f).await;

        // Observer missing from the registry: the graph builds, the walk
        // fails, and refresh still reports success.
        let reconciler = reconciler(&f, "ghost");
        reconciler.configure("priv", 51820, &[]).await.unwrap();
        reconciler.refresh_peers().await.unwrap();
        assert!(f.driver.peers().is_empty());
    }

    #[tokio::test]
    async fn test_configure_swallows_route_exists() {
        let f = fixture();
        let reconciler = reconciler(&f, "a");
        let network = IpNet::from_str("10.0.0.0/24").unwrap();

        f.driver.add_route(network).await.unwrap();
        reconciler
            .configure("priv", 51820, &[network])
            .await
            .unwrap();
        assert_eq!(f.driver.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_triggers_reconcile() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        allow_all(&f).await;

        let reconciler = reconciler(&f, "a");
        reconciler.configure("priv", 51820, &[]).await.unwrap();
        let _handles = reconciler.watch();

        add_node(&f, "b", 2, Some("a")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.driver.peers().len(), 1);
        assert_eq!(f.driver.peers()[0].public_key, "b-key");
    }

    #[tokio::test]
    async fn test_apply_peers_recorded_for_diff() {
        let f = fixture();
        add_node(&f, "a", 1, None).await;
        allow_all(&f).await;

        let reconciler = reconciler(&f, "a");
        reconciler.configure("priv", 51820, &[]).await.unwrap();
        reconciler
            .apply_peers(vec![Peer {
                id: "bootstrap".to_string(),
                public_key: "bootstrap-key".to_string(),
                endpoint: None,
                allowed_ips: vec![IpNet::from_str("10.0.0.9/32").unwrap()],
            }])
            .await
            .unwrap();
        assert_eq!(f.driver.peers().len(), 1);

        // The next reconcile derives an empty set and removes it.
        reconciler.refresh_peers().await.unwrap();
        assert!(f.driver.peers().is_empty());
    }
}

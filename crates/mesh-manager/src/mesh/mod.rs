//! Mesh front door
//!
//! Ties the registry, policy, reconciler, and join pipeline together for
//! one node. `open` either bootstraps a new cluster or joins an existing
//! one; in both paths the WireGuard interface is configured before the
//! first reconcile, and a storage subscription keeps the peer table
//! converged afterwards.

use crate::config::{BootstrapOptions, MeshOptions};
use crate::join::{join_cluster, JoinCoordinator, JoinRpc, RaftControl};
use crate::models::{AclAction, NetworkAcl};
use crate::policy::Networking;
use crate::reconciler::PeerReconciler;
use crate::registry::{derive_ipv6, CreateNodeOptions, Ipam, MeshState, PeerRegistry};
use crate::storage::{MeshStorage, SubscriptionHandle};
use crate::wireguard::{KeyPair, WireGuardDriver};
use crate::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::Rng;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Name of the ACL installed at bootstrap so a fresh cluster is
/// connective before any operator policy is written.
pub const BOOTSTRAP_ACL_NAME: &str = "bootstrap-nodes";

/// Priority of the bootstrap ACL. High enough that operator policy,
/// which conventionally uses lower numbers, is evaluated first.
const BOOTSTRAP_ACL_PRIORITY: i32 = 100;

/// Default cluster IPv4 prefix used at bootstrap.
const DEFAULT_IPV4_PREFIX: &str = "172.16.0.0/12";

/// A mesh node's control plane.
pub struct Mesh {
    opts: MeshOptions,
    storage: Arc<dyn MeshStorage>,
    raft: Arc<dyn RaftControl>,
    reconciler: Arc<PeerReconciler>,
    key: KeyPair,
    subscriptions: Vec<SubscriptionHandle>,
}

impl Mesh {
    /// Open the mesh: bootstrap a new cluster or join an existing one via
    /// `rpc`, configure the interface, and start watching for changes.
    pub async fn open(
        opts: MeshOptions,
        storage: Arc<dyn MeshStorage>,
        driver: Arc<dyn WireGuardDriver>,
        raft: Arc<dyn RaftControl>,
        rpc: Option<Arc<dyn JoinRpc>>,
    ) -> Result<Self> {
        opts.validate()?;
        let key = KeyPair::generate();
        let reconciler = Arc::new(PeerReconciler::new(
            storage.clone(),
            driver,
            &opts.node_id,
        ));

        if let Some(bootstrap) = opts.bootstrap.clone() {
            Self::bootstrap(&opts, &storage, &reconciler, &key, bootstrap).await?;
        } else {
            let rpc = rpc.ok_or_else(|| {
                Error::InvalidArgument(
                    "either bootstrap options or a join transport is required".to_string(),
                )
            })?;
            join_cluster(rpc.as_ref(), &reconciler, &key, &opts).await?;
        }

        let subscriptions = reconciler.watch();
        reconciler.refresh_peers().await?;

        info!(node_id = %opts.node_id, "mesh open");
        Ok(Self {
            opts,
            storage,
            raft,
            reconciler,
            key,
            subscriptions,
        })
    }

    /// Initialize a fresh cluster: persist the cluster prefixes, register
    /// this node as the root of the admission graph, install the default
    /// ACL, and configure the interface.
    async fn bootstrap(
        opts: &MeshOptions,
        storage: &Arc<dyn MeshStorage>,
        reconciler: &Arc<PeerReconciler>,
        key: &KeyPair,
        bootstrap: BootstrapOptions,
    ) -> Result<()> {
        let state = MeshState::new(storage.clone());
        if state.ula_prefix().await.is_ok() {
            return Err(Error::InvalidArgument(
                "cluster already bootstrapped".to_string(),
            ));
        }

        let ula = bootstrap.ula_prefix.unwrap_or_else(random_ula);
        state.set_ula_prefix(ula).await?;
        let mut cluster_networks = vec![IpNet::V6(ula)];

        let mut private_ipv4 = None;
        if !opts.no_ipv4 {
            let ipv4_prefix = bootstrap.ipv4_prefix.unwrap_or_else(|| {
                Ipv4Net::from_str(DEFAULT_IPV4_PREFIX).expect("default prefix parses")
            });
            state.set_ipv4_prefix(ipv4_prefix).await?;
            cluster_networks.push(IpNet::V4(ipv4_prefix));
            let lease = Ipam::new(storage.clone())
                .acquire(&opts.node_id, ipv4_prefix)
                .await?;
            private_ipv4 = Some(lease.ipv4);
        }

        let registry = PeerRegistry::new(storage.clone());
        registry
            .create(CreateNodeOptions {
                id: opts.node_id.clone(),
                public_key: key.public_key_base64(),
                endpoint: opts.endpoint,
                private_ipv4,
                private_ipv6: Some(derive_ipv6(ula, &opts.node_id, 0)?),
                raft_port: opts.raft_port,
                grpc_port: opts.grpc_port,
                wireguard_port: opts.listen_port,
                zones: opts.zones.clone(),
                allowed_ips: opts.allowed_ips.clone(),
                admitted_by: None,
            })
            .await?;

        let networking = Networking::new(storage.clone());
        networking
            .put_network_acl(&NetworkAcl::new(
                BOOTSTRAP_ACL_NAME,
                BOOTSTRAP_ACL_PRIORITY,
                AclAction::Accept,
            ))
            .await?;

        reconciler
            .configure(
                &key.private_key_base64(),
                opts.listen_port,
                &cluster_networks,
            )
            .await?;
        info!(node_id = %opts.node_id, ula = %ula, "bootstrapped cluster");
        Ok(())
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.opts.node_id
    }

    /// This node's WireGuard public key (base64).
    pub fn public_key(&self) -> String {
        self.key.public_key_base64()
    }

    /// The peer registry view.
    pub fn registry(&self) -> PeerRegistry {
        PeerRegistry::new(self.storage.clone())
    }

    /// The network policy view.
    pub fn networking(&self) -> Networking {
        Networking::new(self.storage.clone())
    }

    /// The cluster state view.
    pub fn state(&self) -> MeshState {
        MeshState::new(self.storage.clone())
    }

    /// Leader-side join coordinator, for the serving glue to wire up.
    pub fn join_coordinator(&self) -> JoinCoordinator {
        JoinCoordinator::new(self.storage.clone(), self.raft.clone(), &self.opts.node_id)
    }

    /// Trigger an explicit reconciliation.
    pub async fn refresh_peers(&self) -> Result<()> {
        self.reconciler.refresh_peers().await
    }

    /// Stop watching for changes and release the node's subscriptions.
    pub fn close(mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.cancel();
        }
        info!(node_id = %self.opts.node_id, "mesh closed");
    }
}

/// Generate a random ULA /48 within `fd00::/8`.
fn random_ula() -> Ipv6Net {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xfd;
    rand::thread_rng().fill(&mut bytes[1..6]);
    Ipv6Net::new(Ipv6Addr::from(bytes), 48).expect("48 is a valid prefix length")
}

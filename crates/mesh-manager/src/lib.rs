//! WireGuard Mesh Manager
//!
//! Control plane core for a WireGuard-based overlay mesh network:
//! - Replicated registry of mesh nodes, leases, and ASN assignments
//! - Directed admission graph derived from the registry
//! - Network ACLs and routes with observer-scoped graph filtering
//! - Reconciliation of the filtered graph into WireGuard peer tables
//! - Leader-side join admission with address allocation
//!
//! The replicated log and the WireGuard data plane are external
//! collaborators, reached through the [`storage::MeshStorage`] and
//! [`wireguard::WireGuardDriver`] capabilities.

pub mod config;
pub mod error;
pub mod graph;
pub mod join;
pub mod mesh;
pub mod models;
pub mod policy;
pub mod reconciler;
pub mod registry;
pub mod storage;
pub mod wireguard;

// Re-export core types
pub use config::{BootstrapOptions, MeshOptions};
pub use error::{Error, Result};
pub use graph::{AdjacencyMap, Edge, MeshGraph};
pub use join::{
    JoinCoordinator, JoinRequest, JoinResponse, JoinRpc, PeerInfo, RaftControl,
};
pub use mesh::Mesh;
pub use models::{AclAction, Group, MeshNode, NetworkAcl, NetworkAction, Route};
pub use policy::Networking;
pub use reconciler::PeerReconciler;
pub use registry::{Ipam, Lease, MeshState, PeerRegistry};
pub use storage::{MemoryStorage, MeshStorage, StorageEvent, SubscriptionHandle};
pub use wireguard::{CommandDriver, KeyPair, MemoryDriver, Peer, WireGuardDriver};

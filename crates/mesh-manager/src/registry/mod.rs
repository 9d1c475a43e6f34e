//! Typed registry views over mesh storage
//!
//! The peer registry, IPv4 lease allocator, and cluster state are all pure
//! consumers of the [`MeshStorage`](crate::storage::MeshStorage) capability;
//! none of them hold local caches.

pub mod ipam;
mod peers;
mod state;

pub use ipam::{derive_ipv6, Ipam, Lease};
pub use peers::{CreateNodeOptions, PeerRegistry};
pub use state::MeshState;

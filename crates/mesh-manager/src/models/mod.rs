//! Data models for mesh nodes, policy, and routes

mod acl;
mod node;
mod route;

pub use acl::{AclAction, Group, NetworkAcl, NetworkAction, GROUP_REFERENCE, WILDCARD};
pub use node::{MeshNode, NodeKey};
pub use route::Route;

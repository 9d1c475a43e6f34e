//! Replicated mesh storage capability
//!
//! The control plane is written against a small linearizable key-value
//! capability. The replicated-log-backed implementation lives outside this
//! crate; [`MemoryStorage`] provides a process-local implementation with the
//! same semantics for tests and single-node operation.

mod memory;

pub use memory::MemoryStorage;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Well-known key paths under the registry root.
pub mod keys {
    /// Root prefix for all replicated registry state.
    pub const REGISTRY_PREFIX: &str = "registry/";
    /// Prefix where node records are stored.
    pub const PEERS_PREFIX: &str = "registry/peers/";
    /// Prefix where network ACLs are stored.
    pub const NETWORK_ACLS_PREFIX: &str = "registry/network-acls/";
    /// Prefix where routes are stored.
    pub const ROUTES_PREFIX: &str = "registry/routes/";
    /// Prefix where node groups are stored.
    pub const GROUPS_PREFIX: &str = "registry/groups/";
    /// Prefix where IPv4 leases are stored.
    pub const LEASES_PREFIX: &str = "registry/leases/";
    /// Prefix where ASN assignments are stored.
    pub const ASNS_PREFIX: &str = "registry/asns/";
    /// Cluster IPv4 prefix key.
    pub const IPV4_PREFIX_KEY: &str = "registry/mesh-state/IPv4Prefix";
    /// Cluster IPv6 ULA prefix key.
    pub const ULA_PREFIX_KEY: &str = "registry/mesh-state/ULAPrefix";
}

/// A committed change delivered to subscribers.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// A key was created or updated.
    Put { key: String, value: String },
    /// A key was deleted.
    Delete { key: String },
}

impl StorageEvent {
    /// The key this event applies to.
    pub fn key(&self) -> &str {
        match self {
            StorageEvent::Put { key, .. } => key,
            StorageEvent::Delete { key } => key,
        }
    }
}

/// Subscriber callback. Invoked once per committed change, in commit order,
/// on a dedicated task.
pub type SubscribeFn = Arc<dyn Fn(StorageEvent) + Send + Sync>;

/// Handle for an active subscription. Dropping the handle cancels delivery.
pub struct SubscriptionHandle {
    id: Uuid,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: Uuid, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            id,
            cancel: Some(cancel),
        }
    }

    /// The subscription's identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop delivery. Events committed after cancellation are not delivered.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .finish()
    }
}

/// Linearizable key-value capability backing the mesh registry.
///
/// Keys are slash-delimited paths under [`keys::REGISTRY_PREFIX`]; values are
/// opaque strings. [`crate::Error::KeyNotFound`] is the only sentinel error
/// surfaced to callers.
#[async_trait]
pub trait MeshStorage: Send + Sync {
    /// Fetch the value at `key`.
    async fn get(&self, key: &str) -> Result<String>;

    /// Create or replace the value at `key`. A zero `ttl` means no expiry.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete the value at `key`. Deleting a missing key is an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Return all `(key, value)` pairs whose key starts with `prefix`,
    /// in key order.
    async fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Subscribe to committed changes under `prefix`. Each change is
    /// delivered exactly once, in commit order, on a dedicated task.
    fn subscribe(&self, prefix: &str, f: SubscribeFn) -> SubscriptionHandle;
}

//! Cluster-wide mesh state
//!
//! The cluster IPv4 prefix and IPv6 ULA prefix are written once at bootstrap
//! and immutable thereafter. They are read from storage on demand rather
//! than cached in process-wide state.

use crate::storage::{keys, MeshStorage};
use crate::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::sync::Arc;
use std::time::Duration;

/// View over the `mesh-state/` keys.
#[derive(Clone)]
pub struct MeshState {
    storage: Arc<dyn MeshStorage>,
}

impl MeshState {
    /// Create a mesh-state view over the given storage.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self { storage }
    }

    /// The cluster IPv4 prefix, if IPv4 is enabled.
    pub async fn ipv4_prefix(&self) -> Result<Ipv4Net> {
        let value = self.storage.get(keys::IPV4_PREFIX_KEY).await?;
        value
            .parse()
            .map_err(|_| Error::Storage(format!("malformed IPv4 prefix: {}", value)))
    }

    /// The cluster IPv6 ULA prefix.
    pub async fn ula_prefix(&self) -> Result<Ipv6Net> {
        let value = self.storage.get(keys::ULA_PREFIX_KEY).await?;
        value
            .parse()
            .map_err(|_| Error::Storage(format!("malformed ULA prefix: {}", value)))
    }

    /// Persist the cluster IPv4 prefix. Bootstrap only.
    pub async fn set_ipv4_prefix(&self, prefix: Ipv4Net) -> Result<()> {
        self.storage
            .put(keys::IPV4_PREFIX_KEY, &prefix.to_string(), Duration::ZERO)
            .await
    }

    /// Persist the cluster ULA prefix. Bootstrap only.
    pub async fn set_ula_prefix(&self, prefix: Ipv6Net) -> Result<()> {
        self.storage
            .put(keys::ULA_PREFIX_KEY, &prefix.to_string(), Duration::ZERO)
            .await
    }
}

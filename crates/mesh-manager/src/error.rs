//! Error types for the mesh control plane

use ipnet::IpNet;
use thiserror::Error;

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Mesh manager errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Membership errors
    #[error("Not the cluster leader")]
    NotLeader,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    // Storage errors
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Policy errors
    #[error("Network ACL not found: {0}")]
    AclNotFound(String),

    #[error("Invalid network ACL: {0}")]
    InvalidAcl(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    // Address allocation errors
    #[error("No available addresses in {0}")]
    NoAvailableAddresses(String),

    // WireGuard errors
    #[error("Route already exists: {0}")]
    RouteExists(IpNet),

    #[error("WireGuard driver error: {0}")]
    Driver(String),

    // General errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors a join client may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("decode record: {}", e))
    }
}

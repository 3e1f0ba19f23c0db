//! Error types for meshagent

use thiserror::Error;

/// Result type alias using meshagent Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshagent error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid tunnel name: {0:?}")]
    InvalidTunnelName(String),

    #[error("No host in mesh {mesh} belongs to host group {host_id}")]
    SelfHostMissing { mesh: String, host_id: String },

    #[error("Render error: {0}")]
    Render(String),

    #[error("Tunnel {mesh}: {message}")]
    Tunnel { mesh: String, message: String },

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is an I/O "not found", e.g. a file that was never written
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<hickory_proto::error::ProtoError> for Error {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Error::Dns(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

//! Core error types

use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is malformed or inconsistent
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Transport / NAT / TUN error from the network layer
    #[error(transparent)]
    Network(#[from] stealthtun_network::NetworkError),

    /// Cipher or rotation error
    #[error(transparent)]
    Crypto(#[from] stealthtun_crypto::CryptoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded queue stayed full past the send timeout
    #[error("queue full after send timeout")]
    QueueFull,

    /// OS route installation failed
    #[error("route install failed: {0}")]
    RouteInstallFailed(String),

    /// Both peers are behind symmetric NAT; only the server path works
    #[error("P2P infeasible for this NAT pairing")]
    NatUnfeasible,

    /// The virtual interface could not be created or was lost
    #[error("virtual interface unavailable: {0}")]
    InterfaceUnavailable(String),

    /// The tunnel is shutting down
    #[error("tunnel stopping")]
    Stopping,

    /// Programmer error; aborts the tunnel
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type for engine operations
pub type CoreResult<T> = Result<T, CoreError>;

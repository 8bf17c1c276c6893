//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw socket creation or use failed
    #[error("raw socket error: {0}")]
    RawSocket(String),

    /// Handshake did not complete in time
    #[error("handshake timeout after {0} retries")]
    HandshakeTimeout(usize),

    /// Connection has been closed
    #[error("connection closed")]
    ConnClosed,

    /// Listener has been closed
    #[error("listener closed")]
    ListenerClosed,

    /// Read deadline elapsed
    #[error("operation timed out")]
    Timeout,

    /// Malformed or unexpected packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// TUN device error
    #[error("TUN device error: {0}")]
    TunError(String),

    /// TUN device closed while an operation was blocked on it
    #[error("TUN device unavailable")]
    TunClosed,

    /// Transient buffer exhaustion writing to the TUN device
    #[error("no buffer space available")]
    NoBufferSpace,

    /// NAT traversal failed
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    /// Direct connectivity is impossible for this NAT pairing
    #[error("P2P infeasible: both peers behind symmetric NAT")]
    NatUnfeasible,

    /// Peer not found
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// STUN protocol error
    #[error("STUN protocol error: {0}")]
    Stun(String),

    /// FEC encode/decode error
    #[error("FEC error: {0}")]
    Fec(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

//! StealthTun Network Layer
//!
//! Everything that touches a socket or a device:
//! - `faketcp`: the raw-socket transport whose wire bytes look like TCP
//! - `stun` / `nat`: NAT discovery and classification
//! - `p2p`: UDP hole punching and direct peer transport
//! - `routing`: the peer routing table (direct / relay / server)
//! - `fec`: XOR-parity forward error correction
//! - `tun`: the virtual interface abstraction

pub mod error;
pub mod faketcp;
pub mod fec;
pub mod nat;
pub mod p2p;
pub mod packet;
pub mod routing;
pub mod stun;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use packet::FrameType;

//! StealthTun Core
//!
//! The tunnel engine: binds the fake-TCP transport, the virtual interface,
//! the cipher state and the P2P control plane into the client and server
//! packet pipelines.

pub mod config;
pub mod error;
pub mod netcfg;
pub mod passthrough;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod signaling;
pub mod tunnel;

pub use config::{Config, Mode};
pub use error::{CoreError, CoreResult};
pub use tunnel::Tunnel;

use std::time::Duration;

/// Bound on blocking when a queue is full
pub const QUEUE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Inbound silence threshold that forces a reconnect / client eviction
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra patience granted when the send queue is backed up at idle timeout
pub const IDLE_BACKPRESSURE_EXTENSION: Duration = Duration::from_secs(5);

/// Reconnect backoff cap (seconds); the schedule is min(2^k, cap)
pub const MAX_RECONNECT_BACKOFF_SECS: u64 = 32;

/// Attempts to re-announce P2P info after a reconnect
pub const P2P_REANNOUNCE_RETRIES: u32 = 5;

/// Minimum spacing between P2P requests for the same target
pub const P2P_REQUEST_INTERVAL: Duration = Duration::from_secs(5);

/// How long the server waits for missing peer info before dropping a
/// P2P request (polled once per second)
pub const P2P_PEER_INFO_WAIT_SECS: u32 = 10;

/// Grace given to engine tasks to drain on `stop()`
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest payload one fake-TCP segment may carry
pub const MAX_SEGMENT_PAYLOAD: usize = 1400;

/// ENOBUFS retries when writing to the virtual interface
pub const TUN_WRITE_RETRIES: u32 = 5;

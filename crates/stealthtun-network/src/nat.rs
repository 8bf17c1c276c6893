//! NAT Classification
//!
//! Classifies the local NAT with STUN probes so the control plane can pick
//! a hole-punch initiator and detect infeasible pairings.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::NetworkResult;
use crate::stun::{StunClient, DEFAULT_STUN_SERVERS, STUN_TIMEOUT};

/// NAT type, totally ordered by traversal difficulty:
/// `None < FullCone < RestrictedCone < PortRestrictedCone < Symmetric`.
///
/// The wire values (0-5) are exchanged inside PeerInfo strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NatType {
    /// Detection has not run or failed
    Unknown = 0,
    /// Public IP, no NAT
    None = 1,
    /// Full cone (easiest to traverse)
    FullCone = 2,
    /// Address-restricted cone
    RestrictedCone = 3,
    /// Port-restricted cone
    PortRestrictedCone = 4,
    /// Symmetric (hardest; per-destination mappings)
    Symmetric = 5,
}

impl NatType {
    /// Wire value used in PeerInfo signalling
    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Parse a wire value; anything out of range maps to `Unknown`
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::FullCone,
            3 => Self::RestrictedCone,
            4 => Self::PortRestrictedCone,
            5 => Self::Symmetric,
            _ => Self::Unknown,
        }
    }

    /// Traversal-difficulty level used for initiator selection
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Whether hole punching has a realistic chance from behind this NAT
    pub fn is_traversable(self) -> bool {
        !matches!(self, Self::Symmetric)
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::None => "none",
            Self::FullCone => "full-cone",
            Self::RestrictedCone => "restricted-cone",
            Self::PortRestrictedCone => "port-restricted-cone",
            Self::Symmetric => "symmetric",
        };
        f.write_str(name)
    }
}

/// Whether a direct path between two NAT types is possible at all.
///
/// Only the symmetric/symmetric pairing is declared infeasible; such peers
/// are permanently routed through the server.
pub fn p2p_feasible(a: NatType, b: NatType) -> bool {
    !(a == NatType::Symmetric && b == NatType::Symmetric)
}

/// Classify the local NAT using the RFC 3489 decision tree.
///
/// Probes run on the caller's socket so the discovered mapping matches the
/// port later used for hole punching.
pub async fn detect_nat_type(socket: &UdpSocket) -> NetworkResult<NatType> {
    info!("starting NAT type detection");

    let local_addr = socket.local_addr()?;

    // Test 1: basic binding to the primary server.
    let primary = StunClient::new(DEFAULT_STUN_SERVERS[0], STUN_TIMEOUT);
    let mapped1 = match primary.query(socket, false, false).await {
        Ok(resp) => resp.mapped_addr,
        Err(e) => {
            warn!("NAT detection failed at test 1: {}", e);
            return Ok(NatType::Unknown);
        }
    };
    debug!("test 1: local={} mapped={}", local_addr, mapped1);

    if !is_natted(local_addr, mapped1) {
        info!("no NAT detected (public address)");
        return Ok(NatType::None);
    }

    // Test 2: binding to a second server; a different mapping means the NAT
    // allocates per destination (symmetric).
    let secondary = StunClient::new(DEFAULT_STUN_SERVERS[1], STUN_TIMEOUT);
    if let Ok(resp) = secondary.query(socket, false, false).await {
        debug!("test 2: mapped={}", resp.mapped_addr);
        if resp.mapped_addr != mapped1 {
            info!("symmetric NAT detected (mapping varies per destination)");
            return Ok(NatType::Symmetric);
        }
    }

    // Test 3: CHANGE-REQUEST ip+port; an answer from the alternate address
    // means any external host can reach the mapping.
    if primary.query(socket, true, true).await.is_ok() {
        info!("full cone NAT detected");
        return Ok(NatType::FullCone);
    }

    // Test 4: CHANGE-REQUEST port only distinguishes the restricted cones.
    if primary.query(socket, false, true).await.is_ok() {
        info!("restricted cone NAT detected");
        return Ok(NatType::RestrictedCone);
    }

    info!("port restricted cone NAT detected");
    Ok(NatType::PortRestrictedCone)
}

fn is_natted(local: SocketAddr, mapped: SocketAddr) -> bool {
    local.ip() != mapped.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_ordering_levels() {
        assert!(NatType::None.level() < NatType::FullCone.level());
        assert!(NatType::FullCone.level() < NatType::RestrictedCone.level());
        assert!(NatType::RestrictedCone.level() < NatType::PortRestrictedCone.level());
        assert!(NatType::PortRestrictedCone.level() < NatType::Symmetric.level());
    }

    #[test]
    fn test_wire_roundtrip() {
        for wire in 0..=5u8 {
            assert_eq!(NatType::from_wire(wire).as_wire(), wire);
        }
        assert_eq!(NatType::from_wire(99), NatType::Unknown);
    }

    #[test]
    fn test_feasibility() {
        assert!(p2p_feasible(NatType::FullCone, NatType::Symmetric));
        assert!(p2p_feasible(NatType::Symmetric, NatType::PortRestrictedCone));
        assert!(!p2p_feasible(NatType::Symmetric, NatType::Symmetric));
    }

    #[test]
    fn test_traversable() {
        assert!(NatType::None.is_traversable());
        assert!(NatType::FullCone.is_traversable());
        assert!(NatType::PortRestrictedCone.is_traversable());
        assert!(!NatType::Symmetric.is_traversable());
    }

    #[tokio::test]
    #[ignore] // requires network access
    async fn test_real_nat_detection() {
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let nat_type = detect_nat_type(&socket).await.unwrap();
        println!("detected NAT type: {}", nat_type);
    }
}

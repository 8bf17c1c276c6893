//! UDP Hole Punching
//!
//! Both peers blast punch datagrams at each other's public and local
//! addresses simultaneously; whichever direction opens first carries the
//! confirmation. The server coordinates the simultaneity via Punch frames,
//! this module only drives the socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::NetworkResult;

/// Wire prefix of every P2P control datagram
pub const CONTROL_MAGIC: &str = "STPN1";

/// Control datagram kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Hole-punch probe
    Punch,
    /// NAT-mapping keepalive / punch confirmation
    Keepalive,
}

impl ControlKind {
    fn label(self) -> &'static str {
        match self {
            Self::Punch => "PUNCH",
            Self::Keepalive => "KEEP",
        }
    }
}

/// Encode a control datagram: `STPN1|PUNCH|10.0.0.2`
pub fn encode_control(kind: ControlKind, tunnel_ip: Ipv4Addr) -> Vec<u8> {
    format!("{}|{}|{}", CONTROL_MAGIC, kind.label(), tunnel_ip).into_bytes()
}

/// Decode a control datagram; `None` for data traffic.
pub fn decode_control(data: &[u8]) -> Option<(ControlKind, Ipv4Addr)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.split('|');
    if parts.next()? != CONTROL_MAGIC {
        return None;
    }
    let kind = match parts.next()? {
        "PUNCH" => ControlKind::Punch,
        "KEEP" => ControlKind::Keepalive,
        _ => return None,
    };
    let ip: Ipv4Addr = parts.next()?.parse().ok()?;
    Some((kind, ip))
}

/// Hole punch pacing
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Punch rounds before giving up
    pub max_attempts: u32,
    /// Delay between rounds
    pub interval: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            interval: Duration::from_millis(200),
        }
    }
}

/// Drives punch rounds against a set of candidate addresses.
pub struct HolePuncher {
    socket: Arc<UdpSocket>,
    config: PunchConfig,
}

impl HolePuncher {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            config: PunchConfig::default(),
        }
    }

    /// Send punch datagrams to every candidate address until `connected`
    /// reports success or the attempts run out.
    ///
    /// The inbound side lives in the P2P manager's receive loop, which flips
    /// the connected flag on the first validated datagram from the peer.
    pub async fn punch(
        &self,
        my_tunnel_ip: Ipv4Addr,
        targets: &[SocketAddr],
        connected: impl Fn() -> bool,
    ) -> NetworkResult<bool> {
        let probe = encode_control(ControlKind::Punch, my_tunnel_ip);

        for attempt in 0..self.config.max_attempts {
            if connected() {
                info!("hole punch succeeded after {} rounds", attempt);
                return Ok(true);
            }

            for target in targets {
                if let Err(e) = self.socket.send_to(&probe, target).await {
                    debug!("punch send to {} failed: {}", target, e);
                }
            }

            sleep(self.config.interval).await;
        }

        let done = connected();
        if done {
            info!("hole punch succeeded on final round");
        } else {
            debug!("hole punch exhausted {} rounds", self.config.max_attempts);
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let ip: Ipv4Addr = "10.0.0.7".parse().unwrap();

        let punch = encode_control(ControlKind::Punch, ip);
        assert_eq!(decode_control(&punch), Some((ControlKind::Punch, ip)));

        let keep = encode_control(ControlKind::Keepalive, ip);
        assert_eq!(decode_control(&keep), Some((ControlKind::Keepalive, ip)));
    }

    #[test]
    fn test_data_is_not_control() {
        assert_eq!(decode_control(b"\x01\x45rawdata"), None);
        assert_eq!(decode_control(b"OTHER|PUNCH|10.0.0.1"), None);
        assert_eq!(decode_control(b"STPN1|NOPE|10.0.0.1"), None);
        assert_eq!(decode_control(b"STPN1|PUNCH|not-an-ip"), None);
    }

    #[tokio::test]
    async fn test_punch_between_local_sockets() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b_addr = b.local_addr().unwrap();

        // Peer B answers the first punch, which is what flips "connected"
        // in the real manager.
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = b.recv_from(&mut buf).await.unwrap();
            decode_control(&buf[..n]).expect("expected punch datagram");
            from
        });

        let puncher = HolePuncher::new(a.clone());
        let my_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();

        let got = puncher
            .punch(my_ip, &[b_addr], || false)
            .await
            .unwrap();
        assert!(!got, "no one flipped the connected flag");
        responder.await.unwrap();
    }
}

//! Pass-through Classification
//!
//! Data packets whose inner payload is already encrypted end-to-end (TLS,
//! QUIC, WireGuard, IPsec) may skip the outer AEAD to save CPU. Decisions
//! are cached per flow so the header inspection runs once per 5-tuple.
//! Keepalive and control frames are never skipped.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use stealthtun_network::packet::{ipv4, FrameType};

/// Ports/protocols treated as already-encrypted traffic
const TLS_PORT: u16 = 443;
const WIREGUARD_PORT: u16 = 51820;
const OPENVPN_PORT: u16 = 1194;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ESP: u8 = 50;
const PROTO_AH: u8 = 51;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    proto: u8,
}

fn flow_key(ip_packet: &[u8]) -> Option<FlowKey> {
    if !ipv4::is_ipv4(ip_packet) {
        return None;
    }
    let src = ipv4::source(ip_packet)?;
    let dst = ipv4::destination(ip_packet)?;
    let proto = ipv4::protocol(ip_packet)?;

    let (src_port, dst_port) = match proto {
        PROTO_TCP | PROTO_UDP => ipv4::ports(ip_packet)?,
        _ => (0, 0),
    };

    Some(FlowKey {
        src,
        dst,
        src_port,
        dst_port,
        proto,
    })
}

/// Header-only heuristic: does this IPv4 payload already carry encrypted
/// traffic?
pub fn is_likely_encrypted_traffic(ip_packet: &[u8]) -> bool {
    let Some(proto) = ipv4::protocol(ip_packet) else {
        return false;
    };

    match proto {
        PROTO_ESP | PROTO_AH => true,
        PROTO_TCP | PROTO_UDP => {
            let Some((src_port, dst_port)) = ipv4::ports(ip_packet) else {
                return false;
            };
            let encrypted_port = |p: u16| {
                p == TLS_PORT
                    || (proto == PROTO_UDP && (p == WIREGUARD_PORT || p == OPENVPN_PORT))
            };
            encrypted_port(src_port) || encrypted_port(dst_port)
        }
        _ => false,
    }
}

/// Whether a received tunnel datagram is a plaintext pass-through Data
/// frame: the leading byte is the Data type and the rest parses as IPv4.
pub fn is_plain_passthrough(data: &[u8]) -> bool {
    if data.len() < 1 + ipv4::MIN_HEADER_LEN {
        return false;
    }
    data[0] == FrameType::Data as u8 && ipv4::is_ipv4(&data[1..])
}

/// Per-flow decision cache for the pass-through heuristic
pub struct FlowClassifier {
    cache: Mutex<HashMap<FlowKey, bool>>,
}

impl FlowClassifier {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Should this outgoing tunnel frame (type byte + payload) skip the
    /// outer AEAD?
    pub fn should_skip_encryption(&self, frame: &[u8]) -> bool {
        if frame.first() != Some(&(FrameType::Data as u8)) {
            return false;
        }
        let ip_packet = &frame[1..];

        let Some(key) = flow_key(ip_packet) else {
            return is_likely_encrypted_traffic(ip_packet);
        };

        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return *cached;
        }

        let decision = is_likely_encrypted_traffic(ip_packet);
        self.cache.lock().unwrap().insert(key, decision);
        decision
    }

    /// Drop all cached decisions.
    pub fn flush(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl Default for FlowClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_packet(proto: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 2]);
        pkt[16..20].copy_from_slice(&[1, 2, 3, 4]);
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt
    }

    fn data_frame(ip_packet: &[u8]) -> Vec<u8> {
        let mut frame = vec![FrameType::Data as u8];
        frame.extend_from_slice(ip_packet);
        frame
    }

    #[test]
    fn test_tls_and_vpn_flows_skip() {
        assert!(is_likely_encrypted_traffic(&ip_packet(PROTO_TCP, 50000, 443)));
        assert!(is_likely_encrypted_traffic(&ip_packet(PROTO_UDP, 443, 50000)));
        assert!(is_likely_encrypted_traffic(&ip_packet(PROTO_UDP, 50000, 51820)));
        assert!(is_likely_encrypted_traffic(&ip_packet(PROTO_ESP, 0, 0)));
    }

    #[test]
    fn test_ordinary_flows_do_not_skip() {
        assert!(!is_likely_encrypted_traffic(&ip_packet(PROTO_TCP, 50000, 80)));
        assert!(!is_likely_encrypted_traffic(&ip_packet(PROTO_UDP, 50000, 53)));
        assert!(!is_likely_encrypted_traffic(&ip_packet(1, 0, 0))); // ICMP
    }

    #[test]
    fn test_control_frames_never_skip() {
        let classifier = FlowClassifier::new();
        let keepalive = [FrameType::Keepalive as u8];
        assert!(!classifier.should_skip_encryption(&keepalive));

        let mut peer_info = vec![FrameType::PeerInfo as u8];
        peer_info.extend_from_slice(b"10.0.0.2|1.2.3.4:5|10.0.0.2:5|4");
        assert!(!classifier.should_skip_encryption(&peer_info));
    }

    #[test]
    fn test_decision_is_cached_per_flow() {
        let classifier = FlowClassifier::new();
        let frame = data_frame(&ip_packet(PROTO_TCP, 50000, 443));

        assert!(classifier.should_skip_encryption(&frame));
        assert_eq!(classifier.cache.lock().unwrap().len(), 1);

        // Second packet of the same flow hits the cache.
        assert!(classifier.should_skip_encryption(&frame));
        assert_eq!(classifier.cache.lock().unwrap().len(), 1);

        classifier.flush();
        assert_eq!(classifier.cache.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_plain_passthrough_detection() {
        let frame = data_frame(&ip_packet(PROTO_TCP, 1, 443));
        assert!(is_plain_passthrough(&frame));

        assert!(!is_plain_passthrough(&[FrameType::Keepalive as u8]));
        assert!(!is_plain_passthrough(b"random garbage bytes here ...."));
    }
}

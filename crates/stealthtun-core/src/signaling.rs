//! Control-plane Codecs
//!
//! The string and JSON payloads carried inside control frames:
//! - PeerInfo: `TunnelIP|PublicAddr|LocalAddr[|NATType]` or `DISCONNECT|IP`
//! - RouteInfo: comma-separated CIDR list
//! - ConfigUpdate: `{"key": "...", "routes": [...]}`

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use stealthtun_network::nat::NatType;
use stealthtun_network::packet::FrameType;

/// A client's P2P endpoints as announced through the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub tunnel_ip: Ipv4Addr,
    /// `host:port` reachable from the internet
    pub public_addr: String,
    /// `host:port` on the local network (same-LAN shortcut)
    pub local_addr: String,
    pub nat_type: NatType,
}

impl PeerAnnouncement {
    /// Encode as the pipe-delimited wire string.
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.tunnel_ip,
            self.public_addr,
            self.local_addr,
            self.nat_type.as_wire()
        )
    }

    /// UDP port parsed from the public address, falling back to the local
    /// one. Used for initiator tie-breaking.
    pub fn p2p_port(&self) -> Option<u16> {
        parse_port(&self.public_addr).or_else(|| parse_port(&self.local_addr))
    }
}

fn parse_port(addr: &str) -> Option<u16> {
    addr.rsplit_once(':')?.1.parse().ok()
}

/// Everything a PeerInfo frame can carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerInfoMessage {
    Announce(PeerAnnouncement),
    Disconnect(Ipv4Addr),
}

impl PeerInfoMessage {
    /// Parse a PeerInfo payload. The NAT type field is optional for
    /// announcements.
    pub fn parse(payload: &str) -> Option<Self> {
        let parts: Vec<&str> = payload.split('|').collect();

        if parts.first() == Some(&"DISCONNECT") {
            let ip = parts.get(1)?.parse().ok()?;
            return Some(Self::Disconnect(ip));
        }

        if parts.len() < 3 {
            return None;
        }
        let tunnel_ip: Ipv4Addr = parts[0].parse().ok()?;
        let nat_type = parts
            .get(3)
            .and_then(|s| s.parse::<u8>().ok())
            .map(NatType::from_wire)
            .unwrap_or(NatType::Unknown);

        Some(Self::Announce(PeerAnnouncement {
            tunnel_ip,
            public_addr: parts[1].to_string(),
            local_addr: parts[2].to_string(),
            nat_type,
        }))
    }

    /// Encode back to the wire string.
    pub fn encode(&self) -> String {
        match self {
            Self::Announce(a) => a.encode(),
            Self::Disconnect(ip) => format!("DISCONNECT|{}", ip),
        }
    }
}

/// Server-pushed configuration update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdateMessage {
    /// Fresh tunnel key (hex)
    pub key: String,

    /// Replacement advertised routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<String>>,
}

/// Encode a route list as the RouteInfo CSV payload.
pub fn encode_route_list(routes: &[String]) -> String {
    routes.join(",")
}

/// Parse a RouteInfo CSV payload, dropping empty entries.
pub fn parse_route_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build a control frame: type byte followed by the payload.
pub fn control_frame(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(frame_type as u8);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_roundtrip() {
        let ann = PeerAnnouncement {
            tunnel_ip: "10.0.0.2".parse().unwrap(),
            public_addr: "203.0.113.9:41000".into(),
            local_addr: "192.168.1.50:41000".into(),
            nat_type: NatType::PortRestrictedCone,
        };

        let encoded = ann.encode();
        assert_eq!(encoded, "10.0.0.2|203.0.113.9:41000|192.168.1.50:41000|4");

        match PeerInfoMessage::parse(&encoded).unwrap() {
            PeerInfoMessage::Announce(parsed) => assert_eq!(parsed, ann),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_announcement_without_nat_type() {
        let msg = PeerInfoMessage::parse("10.0.0.3|1.2.3.4:5000|10.1.1.3:5000").unwrap();
        match msg {
            PeerInfoMessage::Announce(a) => {
                assert_eq!(a.nat_type, NatType::Unknown);
                assert_eq!(a.p2p_port(), Some(5000));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_message() {
        let msg = PeerInfoMessage::parse("DISCONNECT|10.0.0.7").unwrap();
        assert_eq!(msg, PeerInfoMessage::Disconnect("10.0.0.7".parse().unwrap()));
        assert_eq!(msg.encode(), "DISCONNECT|10.0.0.7");
    }

    #[test]
    fn test_malformed_peer_info() {
        assert!(PeerInfoMessage::parse("").is_none());
        assert!(PeerInfoMessage::parse("10.0.0.2|only-public").is_none());
        assert!(PeerInfoMessage::parse("not-an-ip|a:1|b:2").is_none());
        assert!(PeerInfoMessage::parse("DISCONNECT|junk").is_none());
    }

    #[test]
    fn test_route_list_roundtrip() {
        let routes = vec!["10.1.0.0/16".to_string(), "192.168.4.0/24".to_string()];
        let encoded = encode_route_list(&routes);
        assert_eq!(parse_route_list(&encoded), routes);

        assert_eq!(
            parse_route_list(" 10.1.0.0/16 ,, 192.168.4.0/24 ,"),
            routes
        );
        assert!(parse_route_list("").is_empty());
    }

    #[test]
    fn test_config_update_json() {
        let msg = ConfigUpdateMessage {
            key: "aabbcc".into(),
            routes: Some(vec!["10.9.0.0/16".into()]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ConfigUpdateMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key, "aabbcc");
        assert_eq!(parsed.routes.unwrap(), vec!["10.9.0.0/16".to_string()]);

        // The routes field is optional on the wire.
        let parsed: ConfigUpdateMessage = serde_json::from_str(r#"{"key":"k"}"#).unwrap();
        assert!(parsed.routes.is_none());
    }

    #[test]
    fn test_control_frame_layout() {
        let frame = control_frame(FrameType::P2pRequest, b"10.0.0.9");
        assert_eq!(frame[0], 0x08);
        assert_eq!(&frame[1..], b"10.0.0.9");
    }
}

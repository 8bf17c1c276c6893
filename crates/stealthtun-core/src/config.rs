//! Tunnel Configuration
//!
//! JSON config file loading with mode-dependent defaults, the MTU clamp
//! that keeps encrypted frames inside one fake-TCP segment, and in-place
//! key rewriting after rotation.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::MAX_SEGMENT_PAYLOAD;

/// Default MTU applied when the config says 0 (auto)
pub const DEFAULT_MTU: usize = 1400;

/// Frame type byte in front of every tunnel datagram
const FRAME_TYPE_OVERHEAD: usize = 1;

/// Tunnel operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

fn default_transport() -> String {
    "rawtcp".to_string()
}

fn default_fec_data_shards() -> usize {
    10
}

fn default_fec_parity_shards() -> usize {
    3
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_queue_size() -> usize {
    1000
}

fn default_timeout() -> u64 {
    10
}

fn default_max_clients() -> usize {
    100
}

fn default_p2p_keepalive_interval() -> u64 {
    25
}

fn default_route_advert_interval() -> u64 {
    300
}

fn default_route_update_interval() -> u64 {
    30
}

fn default_max_hops() -> u32 {
    3
}

/// Tunnel configuration, loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// client or server
    pub mode: Mode,

    /// Listen address (server) or bind hint (client)
    #[serde(default)]
    pub local_addr: String,

    /// Server address to dial (client mode)
    #[serde(default)]
    pub remote_addr: String,

    /// Tunnel address in CIDR form, e.g. `10.0.0.2/24`
    pub tunnel_addr: String,

    /// Requested TUN device name; empty = kernel assigned
    #[serde(default)]
    pub tun_name: String,

    /// MTU for the virtual interface; 0 = auto
    #[serde(default)]
    pub mtu: usize,

    /// Transport selector; only `rawtcp` is supported
    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default = "default_fec_data_shards")]
    pub fec_data_shards: usize,

    #[serde(default = "default_fec_parity_shards")]
    pub fec_parity_shards: usize,

    /// Encryption passphrase; empty disables encryption
    #[serde(default)]
    pub key: String,

    /// Tunnel keepalive cadence in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    #[serde(default = "default_queue_size")]
    pub send_queue_size: usize,

    #[serde(default = "default_queue_size")]
    pub recv_queue_size: usize,

    /// Dial/handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whether the server accepts more than one client. Omitted means
    /// "true on servers, false on clients"; use [`Config::multi_client`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_client: Option<bool>,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Forbid client-to-client forwarding on the server
    #[serde(default)]
    pub client_isolation: bool,

    /// Enable the P2P control plane (client mode)
    #[serde(default)]
    pub p2p_enabled: bool,

    /// UDP port for P2P traffic; 0 = OS assigned
    #[serde(default)]
    pub p2p_port: u16,

    /// P2P NAT keepalive cadence in seconds
    #[serde(default = "default_p2p_keepalive_interval")]
    pub p2p_keepalive_interval: u64,

    /// Run STUN NAT classification before announcing peer info
    #[serde(default)]
    pub enable_nat_detection: bool,

    /// Route advertisement cadence in seconds
    #[serde(default = "default_route_advert_interval")]
    pub route_advert_interval: u64,

    /// Routing table refresh cadence in seconds
    #[serde(default = "default_route_update_interval")]
    pub route_update_interval: u64,

    /// Server key rotation / config push cadence in seconds; 0 disables
    #[serde(default)]
    pub config_push_interval: u64,

    /// Extra CIDRs this node advertises
    #[serde(default)]
    pub routes: Vec<String>,

    /// Maintain a routing table on the server as well
    #[serde(default)]
    pub enable_mesh_routing: bool,

    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::ConfigInvalid(format!("cannot read config: {}", e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| CoreError::ConfigInvalid(format!("cannot parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective multi-client flag: explicit values win, otherwise servers
    /// default to true and clients to false.
    pub fn multi_client(&self) -> bool {
        self.multi_client.unwrap_or(self.mode == Mode::Server)
    }

    /// Basic consistency checks.
    pub fn validate(&self) -> CoreResult<()> {
        if self.mode == Mode::Client && self.remote_addr.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "client mode requires remote_addr".into(),
            ));
        }
        if self.mode == Mode::Server && self.local_addr.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "server mode requires local_addr".into(),
            ));
        }
        parse_tunnel_addr(&self.tunnel_addr)?;
        if self.fec_data_shards == 0 || self.fec_parity_shards == 0 {
            return Err(CoreError::ConfigInvalid(
                "FEC shard counts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Tunnel IP of this node.
    pub fn tunnel_ip(&self) -> CoreResult<Ipv4Addr> {
        Ok(parse_tunnel_addr(&self.tunnel_addr)?.0)
    }

    /// Resolve the effective MTU: apply the auto default, then clamp so an
    /// encrypted frame (type byte + AEAD overhead) still fits one fake-TCP
    /// segment.
    pub fn resolve_mtu(&mut self, cipher_overhead: Option<usize>) {
        if self.mtu == 0 {
            self.mtu = DEFAULT_MTU;
            info!("MTU auto-selected: {}", self.mtu);
        }

        if let Some(overhead) = cipher_overhead {
            if self.transport == "rawtcp" {
                let max_safe = MAX_SEGMENT_PAYLOAD - FRAME_TYPE_OVERHEAD - overhead;
                if self.mtu > max_safe {
                    warn!(
                        "clamping MTU from {} to {} so encrypted frames fit one segment",
                        self.mtu, max_safe
                    );
                    self.mtu = max_safe;
                }
            }
        }
    }
}

/// Parse `IP/prefix` into address and prefix length.
pub fn parse_tunnel_addr(tunnel_addr: &str) -> CoreResult<(Ipv4Addr, u8)> {
    let (ip_str, prefix_str) = tunnel_addr
        .split_once('/')
        .ok_or_else(|| CoreError::ConfigInvalid("tunnel address must be IP/prefix".into()))?;

    let ip: Ipv4Addr = ip_str
        .parse()
        .map_err(|_| CoreError::ConfigInvalid(format!("invalid tunnel IP: {}", ip_str)))?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| CoreError::ConfigInvalid(format!("invalid prefix: {}", prefix_str)))?;
    if prefix > 32 {
        return Err(CoreError::ConfigInvalid(format!(
            "prefix must be 0-32, got {}",
            prefix
        )));
    }

    Ok((ip, prefix))
}

/// Derive the server's tunnel address from a client's: the convention is
/// that the server sits at host .1 and the first client at .2.
pub fn peer_tunnel_ip(tunnel_addr: &str) -> CoreResult<Ipv4Addr> {
    let (ip, _) = parse_tunnel_addr(tunnel_addr)?;
    let octets = ip.octets();
    let last = octets[3];
    if last == 0 || last == 255 {
        return Err(CoreError::ConfigInvalid(
            "cannot derive peer from network or broadcast address".into(),
        ));
    }
    let peer_last = if last == 1 { 2 } else { 1 };
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], peer_last))
}

/// Rewrite the `key` field of a config file in place, preserving all other
/// fields. Used to persist rotated keys; failures are logged by the caller
/// and never abort a rotation.
pub fn update_config_key(path: impl AsRef<Path>, new_key: &str) -> CoreResult<()> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| CoreError::ConfigInvalid(format!("cannot parse config: {}", e)))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| CoreError::ConfigInvalid("config root is not an object".into()))?;
    obj.insert("key".to_string(), serde_json::Value::String(new_key.into()));

    let pretty = serde_json::to_string_pretty(&value)
        .map_err(|e| CoreError::ConfigInvalid(e.to_string()))?;
    std::fs::write(path, pretty)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_server_multi_client_defaults_true() {
        let file = write_config(
            r#"{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24"
}"#,
        );
        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.multi_client());
        assert_eq!(cfg.max_clients, 100);
    }

    #[test]
    fn test_server_multi_client_explicit_false_preserved() {
        let file = write_config(
            r#"{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24",
  "multi_client": false
}"#,
        );
        let cfg = Config::load(file.path()).unwrap();
        assert!(!cfg.multi_client());
    }

    #[test]
    fn test_server_multi_client_explicit_true_preserved() {
        let file = write_config(
            r#"{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24",
  "multi_client": true
}"#,
        );
        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.multi_client());
    }

    #[test]
    fn test_client_multi_client_defaults_false() {
        let file = write_config(
            r#"{
  "mode": "client",
  "local_addr": "0.0.0.0:9000",
  "remote_addr": "192.168.1.1:9000",
  "tunnel_addr": "10.0.0.2/24"
}"#,
        );
        let cfg = Config::load(file.path()).unwrap();
        assert!(!cfg.multi_client());
    }

    fn base_config(mtu: usize, transport: &str, key: &str) -> Config {
        let file = write_config(&format!(
            r#"{{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24",
  "mtu": {},
  "transport": "{}",
  "key": "{}"
}}"#,
            mtu, transport, key
        ));
        Config::load(file.path()).unwrap()
    }

    #[test]
    fn test_mtu_clamped_for_encrypted_rawtcp() {
        let mut cfg = base_config(1400, "rawtcp", "test-key-123");
        cfg.resolve_mtu(Some(28));
        assert_eq!(cfg.mtu, 1371);
    }

    #[test]
    fn test_mtu_already_safe_unchanged() {
        let mut cfg = base_config(1371, "rawtcp", "test-key-123");
        cfg.resolve_mtu(Some(28));
        assert_eq!(cfg.mtu, 1371);

        let mut cfg = base_config(1200, "rawtcp", "test-key-123");
        cfg.resolve_mtu(Some(28));
        assert_eq!(cfg.mtu, 1200);
    }

    #[test]
    fn test_mtu_unchanged_without_encryption() {
        let mut cfg = base_config(1400, "rawtcp", "");
        cfg.resolve_mtu(None);
        assert_eq!(cfg.mtu, 1400);
    }

    #[test]
    fn test_mtu_unchanged_for_other_transport() {
        let mut cfg = base_config(1400, "udp", "test-key-123");
        cfg.resolve_mtu(Some(28));
        assert_eq!(cfg.mtu, 1400);
    }

    #[test]
    fn test_mtu_auto_default() {
        let mut cfg = base_config(0, "rawtcp", "");
        cfg.resolve_mtu(None);
        assert_eq!(cfg.mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_tunnel_addr_parsing() {
        assert_eq!(
            parse_tunnel_addr("10.0.0.2/24").unwrap(),
            ("10.0.0.2".parse().unwrap(), 24)
        );
        assert!(parse_tunnel_addr("10.0.0.2").is_err());
        assert!(parse_tunnel_addr("not-an-ip/24").is_err());
        assert!(parse_tunnel_addr("10.0.0.2/33").is_err());
    }

    #[test]
    fn test_peer_tunnel_ip_derivation() {
        assert_eq!(
            peer_tunnel_ip("10.0.0.2/24").unwrap(),
            "10.0.0.1".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            peer_tunnel_ip("10.0.0.1/24").unwrap(),
            "10.0.0.2".parse::<Ipv4Addr>().unwrap()
        );
        assert!(peer_tunnel_ip("10.0.0.0/24").is_err());
        assert!(peer_tunnel_ip("10.0.0.255/24").is_err());
    }

    #[test]
    fn test_update_config_key_preserves_other_fields() {
        let file = write_config(
            r#"{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24",
  "key": "old-key-value-123",
  "max_clients": 7
}"#,
        );

        update_config_key(file.path(), "new-rotated-key-456").unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.key, "new-rotated-key-456");
        assert_eq!(cfg.max_clients, 7);
    }

    #[test]
    fn test_validation_errors() {
        let file = write_config(
            r#"{
  "mode": "client",
  "tunnel_addr": "10.0.0.2/24"
}"#,
        );
        assert!(matches!(
            Config::load(file.path()),
            Err(CoreError::ConfigInvalid(_))
        ));
    }
}

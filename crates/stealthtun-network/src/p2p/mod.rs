//! P2P Transport
//!
//! One UDP socket per client carries both hole-punch control datagrams and
//! encrypted tunnel data to peers with a direct path. The manager owns the
//! peer registry and reports inbound data to the engine through a channel.

pub mod hole_punch;

pub use hole_punch::{ControlKind, HolePuncher, PunchConfig};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::nat::{self, NatType};
use hole_punch::{decode_control, encode_control};

/// Default cadence of P2P NAT keepalives
pub const DEFAULT_P2P_KEEPALIVE: Duration = Duration::from_secs(25);

/// Inbound data delivered to the engine: `(peer tunnel IP, datagram)`
pub type P2pPacket = (Ipv4Addr, Vec<u8>);

/// What the manager knows about one peer
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub tunnel_ip: Ipv4Addr,
    pub public_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub nat_type: NatType,
}

struct PeerState {
    endpoint: PeerEndpoint,
    /// Address of the first validated inbound datagram
    verified_addr: Option<SocketAddr>,
    connected: bool,
    last_seen: Instant,
}

struct Inner {
    peers: HashMap<Ipv4Addr, PeerState>,
    /// Reverse index for data demux
    by_addr: HashMap<SocketAddr, Ipv4Addr>,
}

/// P2P connection manager
pub struct P2pManager {
    my_tunnel_ip: Ipv4Addr,
    port: u16,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    inner: Arc<RwLock<Inner>>,
    my_nat: RwLock<NatType>,
    handler: RwLock<Option<mpsc::Sender<P2pPacket>>>,
    keepalive_interval: RwLock<Duration>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl P2pManager {
    /// Create a manager for this client. `port = 0` lets the OS pick.
    pub fn new(my_tunnel_ip: Ipv4Addr, port: u16) -> Self {
        Self {
            my_tunnel_ip,
            port,
            socket: RwLock::new(None),
            inner: Arc::new(RwLock::new(Inner {
                peers: HashMap::new(),
                by_addr: HashMap::new(),
            })),
            my_nat: RwLock::new(NatType::Unknown),
            handler: RwLock::new(None),
            keepalive_interval: RwLock::new(DEFAULT_P2P_KEEPALIVE),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Override the NAT keepalive cadence.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        *self.keepalive_interval.write().unwrap() = interval;
    }

    /// Register the channel that receives inbound data datagrams.
    pub fn set_packet_handler(&self, tx: mpsc::Sender<P2pPacket>) {
        *self.handler.write().unwrap() = Some(tx);
    }

    /// Bind the socket and start the receive and keepalive loops.
    pub async fn start(self: Arc<Self>) -> NetworkResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", self.port)).await?);
        info!("P2P socket bound on {}", socket.local_addr()?);
        *self.socket.write().unwrap() = Some(socket.clone());

        let mgr = self.clone();
        tokio::spawn(async move { mgr.recv_loop(socket).await });

        tokio::spawn(async move { self.keepalive_loop().await });

        Ok(())
    }

    /// Stop the loops. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    /// The UDP port peers should punch toward.
    pub fn local_port(&self) -> u16 {
        self.socket
            .read()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(self.port)
    }

    /// Detected NAT type of this client.
    pub fn nat_type(&self) -> NatType {
        *self.my_nat.read().unwrap()
    }

    /// Run STUN-based NAT classification on the P2P socket.
    pub async fn detect_nat(&self) -> NatType {
        let socket = self.socket.read().unwrap().clone();
        let Some(socket) = socket else {
            return NatType::Unknown;
        };

        let detected = match nat::detect_nat_type(&socket).await {
            Ok(t) => t,
            Err(e) => {
                warn!("NAT detection failed: {}", e);
                NatType::Unknown
            }
        };
        *self.my_nat.write().unwrap() = detected;
        detected
    }

    /// Insert or refresh a peer's endpoints.
    pub fn add_peer(&self, endpoint: PeerEndpoint) {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .peers
            .entry(endpoint.tunnel_ip)
            .or_insert_with(|| PeerState {
                endpoint: endpoint.clone(),
                verified_addr: None,
                connected: false,
                last_seen: Instant::now(),
            });
        entry.endpoint = endpoint;
        entry.last_seen = Instant::now();
    }

    /// Drop all state for a peer.
    pub fn remove_peer(&self, tunnel_ip: Ipv4Addr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.peers.remove(&tunnel_ip) {
            if let Some(addr) = state.verified_addr {
                inner.by_addr.remove(&addr);
            }
        }
    }

    /// Whether a direct path to this peer is currently open.
    pub fn is_connected(&self, tunnel_ip: Ipv4Addr) -> bool {
        self.inner
            .read()
            .unwrap()
            .peers
            .get(&tunnel_ip)
            .map(|p| p.connected)
            .unwrap_or(false)
    }

    /// Whether NAT types permit a direct path to this peer at all.
    pub fn can_reach(&self, tunnel_ip: Ipv4Addr) -> bool {
        let peer_nat = self
            .inner
            .read()
            .unwrap()
            .peers
            .get(&tunnel_ip)
            .map(|p| p.endpoint.nat_type)
            .unwrap_or(NatType::Unknown);
        nat::p2p_feasible(self.nat_type(), peer_nat)
    }

    /// Punch toward a known peer. Returns true when the path opened.
    pub async fn connect_to_peer(&self, tunnel_ip: Ipv4Addr) -> NetworkResult<bool> {
        let socket = self
            .socket
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| NetworkError::NatTraversalFailed("P2P manager not started".into()))?;

        let (targets, peer_nat) = {
            let inner = self.inner.read().unwrap();
            let state = inner
                .peers
                .get(&tunnel_ip)
                .ok_or_else(|| NetworkError::PeerNotFound(tunnel_ip.to_string()))?;
            let mut targets = Vec::new();
            if let Some(addr) = state.endpoint.public_addr {
                targets.push(addr);
            }
            if let Some(addr) = state.endpoint.local_addr {
                targets.push(addr);
            }
            (targets, state.endpoint.nat_type)
        };

        if targets.is_empty() {
            return Err(NetworkError::NatTraversalFailed(format!(
                "no candidate addresses for {}",
                tunnel_ip
            )));
        }
        if !nat::p2p_feasible(self.nat_type(), peer_nat) {
            return Err(NetworkError::NatUnfeasible);
        }

        debug!("hole punching toward {} via {:?}", tunnel_ip, targets);
        let puncher = HolePuncher::new(socket);
        let inner = self.inner.clone();
        let connected = move || {
            inner
                .read()
                .unwrap()
                .peers
                .get(&tunnel_ip)
                .map(|p| p.connected)
                .unwrap_or(false)
        };

        puncher.punch(self.my_tunnel_ip, &targets, connected).await
    }

    /// Send an (already sealed) tunnel datagram to a connected peer.
    pub async fn send_packet(&self, tunnel_ip: Ipv4Addr, data: &[u8]) -> NetworkResult<()> {
        let socket = self
            .socket
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| NetworkError::NatTraversalFailed("P2P manager not started".into()))?;

        let target = {
            let inner = self.inner.read().unwrap();
            let state = inner
                .peers
                .get(&tunnel_ip)
                .ok_or_else(|| NetworkError::PeerNotFound(tunnel_ip.to_string()))?;
            if !state.connected {
                return Err(NetworkError::NatTraversalFailed(format!(
                    "no direct path to {}",
                    tunnel_ip
                )));
            }
            state
                .verified_addr
                .or(state.endpoint.public_addr)
                .ok_or_else(|| NetworkError::PeerNotFound(tunnel_ip.to_string()))?
        };

        match socket.send_to(data, target).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // A failed direct send demotes the peer back to the server
                // path until the next successful punch.
                self.mark_disconnected(tunnel_ip);
                Err(NetworkError::Io(e))
            }
        }
    }

    /// Force a peer back onto the server path.
    pub fn mark_disconnected(&self, tunnel_ip: Ipv4Addr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.peers.get_mut(&tunnel_ip) {
            state.connected = false;
        }
    }

    /// Tunnel IPs of peers with an open direct path.
    pub fn connected_peers(&self) -> Vec<Ipv4Addr> {
        self.inner
            .read()
            .unwrap()
            .peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.endpoint.tunnel_ip)
            .collect()
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65535];

        loop {
            let (n, from) = tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            warn!("P2P receive error: {}", e);
                        }
                        return;
                    }
                },
                _ = self.shutdown.notified() => return,
            };

            let data = &buf[..n];

            if let Some((kind, peer_ip)) = decode_control(data) {
                self.handle_control(&socket, kind, peer_ip, from).await;
                continue;
            }

            // Data datagram: demux by verified source address.
            let peer_ip = {
                let mut inner = self.inner.write().unwrap();
                match inner.by_addr.get(&from).copied() {
                    Some(ip) => {
                        if let Some(state) = inner.peers.get_mut(&ip) {
                            state.last_seen = Instant::now();
                        }
                        Some(ip)
                    }
                    None => None,
                }
            };

            let Some(peer_ip) = peer_ip else {
                trace!("dropping datagram from unknown P2P source {}", from);
                continue;
            };

            let handler = self.handler.read().unwrap().clone();
            if let Some(tx) = handler {
                if tx.send((peer_ip, data.to_vec())).await.is_err() {
                    debug!("P2P packet handler closed");
                }
            }
        }
    }

    /// Validate a control datagram and update connectivity state.
    async fn handle_control(
        &self,
        socket: &UdpSocket,
        kind: ControlKind,
        peer_ip: Ipv4Addr,
        from: SocketAddr,
    ) {
        let newly_connected = {
            let mut inner = self.inner.write().unwrap();
            let Some(state) = inner.peers.get_mut(&peer_ip) else {
                trace!("control datagram for unknown peer {}", peer_ip);
                return;
            };

            state.last_seen = Instant::now();
            let first = !state.connected;
            state.connected = true;
            if state.verified_addr != Some(from) {
                if let Some(old) = state.verified_addr.replace(from) {
                    inner.by_addr.remove(&old);
                }
                inner.by_addr.insert(from, peer_ip);
            }
            first
        };

        if newly_connected {
            info!("direct P2P path to {} opened via {}", peer_ip, from);
        }

        // Answer punches so the remote side confirms quickly.
        if kind == ControlKind::Punch {
            let reply = encode_control(ControlKind::Keepalive, self.my_tunnel_ip);
            if let Err(e) = socket.send_to(&reply, from).await {
                debug!("punch reply to {} failed: {}", from, e);
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        loop {
            let interval = *self.keepalive_interval.read().unwrap();
            tokio::select! {
                _ = sleep(interval) => {}
                _ = self.shutdown.notified() => return,
            }

            let socket = self.socket.read().unwrap().clone();
            let Some(socket) = socket else { return };

            let targets: Vec<SocketAddr> = {
                let inner = self.inner.read().unwrap();
                inner
                    .peers
                    .values()
                    .filter(|p| p.connected)
                    .filter_map(|p| p.verified_addr)
                    .collect()
            };

            let keep = encode_control(ControlKind::Keepalive, self.my_tunnel_ip);
            for target in targets {
                if let Err(e) = socket.send_to(&keep, target).await {
                    debug!("P2P keepalive to {} failed: {}", target, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(ip: &str, public: Option<&str>) -> PeerEndpoint {
        PeerEndpoint {
            tunnel_ip: ip.parse().unwrap(),
            public_addr: public.map(|p| p.parse().unwrap()),
            local_addr: None,
            nat_type: NatType::PortRestrictedCone,
        }
    }

    #[tokio::test]
    async fn test_punch_establishes_both_directions() {
        let ip_a: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let ip_b: Ipv4Addr = "10.0.0.3".parse().unwrap();

        let mgr_a = Arc::new(P2pManager::new(ip_a, 0));
        let mgr_b = Arc::new(P2pManager::new(ip_b, 0));
        mgr_a.clone().start().await.unwrap();
        mgr_b.clone().start().await.unwrap();

        let addr_a: SocketAddr = format!("127.0.0.1:{}", mgr_a.local_port()).parse().unwrap();
        let addr_b: SocketAddr = format!("127.0.0.1:{}", mgr_b.local_port()).parse().unwrap();

        mgr_a.add_peer(PeerEndpoint {
            tunnel_ip: ip_b,
            public_addr: Some(addr_b),
            local_addr: None,
            nat_type: NatType::None,
        });
        mgr_b.add_peer(PeerEndpoint {
            tunnel_ip: ip_a,
            public_addr: Some(addr_a),
            local_addr: None,
            nat_type: NatType::None,
        });

        let opened = mgr_a.connect_to_peer(ip_b).await.unwrap();
        assert!(opened);
        assert!(mgr_a.is_connected(ip_b));

        // The punch replies also opened the reverse direction.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mgr_b.is_connected(ip_a));

        mgr_a.stop();
        mgr_b.stop();
    }

    #[tokio::test]
    async fn test_data_flows_to_handler() {
        let ip_a: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let ip_b: Ipv4Addr = "10.0.0.3".parse().unwrap();

        let mgr_a = Arc::new(P2pManager::new(ip_a, 0));
        let mgr_b = Arc::new(P2pManager::new(ip_b, 0));
        mgr_a.clone().start().await.unwrap();
        mgr_b.clone().start().await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        mgr_b.set_packet_handler(tx);

        let addr_a: SocketAddr = format!("127.0.0.1:{}", mgr_a.local_port()).parse().unwrap();
        let addr_b: SocketAddr = format!("127.0.0.1:{}", mgr_b.local_port()).parse().unwrap();
        mgr_a.add_peer(PeerEndpoint {
            tunnel_ip: ip_b,
            public_addr: Some(addr_b),
            local_addr: None,
            nat_type: NatType::None,
        });
        mgr_b.add_peer(PeerEndpoint {
            tunnel_ip: ip_a,
            public_addr: Some(addr_a),
            local_addr: None,
            nat_type: NatType::None,
        });

        assert!(mgr_a.connect_to_peer(ip_b).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        mgr_a.send_packet(ip_b, b"\x01payload").await.unwrap();

        let (from_ip, data) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from_ip, ip_a);
        assert_eq!(data, b"\x01payload");

        mgr_a.stop();
        mgr_b.stop();
    }

    #[tokio::test]
    async fn test_send_without_path_fails() {
        let mgr = Arc::new(P2pManager::new("10.0.0.2".parse().unwrap(), 0));
        mgr.clone().start().await.unwrap();

        mgr.add_peer(endpoint("10.0.0.9", Some("127.0.0.1:9")));
        let result = mgr.send_packet("10.0.0.9".parse().unwrap(), b"data").await;
        assert!(result.is_err());

        mgr.stop();
    }

    #[test]
    fn test_unfeasible_pairing() {
        let mgr = P2pManager::new("10.0.0.2".parse().unwrap(), 0);
        *mgr.my_nat.write().unwrap() = NatType::Symmetric;

        let mut ep = endpoint("10.0.0.5", Some("1.2.3.4:5000"));
        ep.nat_type = NatType::Symmetric;
        mgr.add_peer(ep);

        assert!(!mgr.can_reach("10.0.0.5".parse().unwrap()));
    }
}

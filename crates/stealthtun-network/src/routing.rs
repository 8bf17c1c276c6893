//! Peer Routing Table
//!
//! Tracks every known peer and the best way to reach it: a direct P2P path,
//! a relay through another peer, or the central server. Reads dominate, so
//! the whole table sits behind one RwLock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::nat::NatType;

/// How long a silent peer keeps its routes
pub const STALE_ROUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Path selection for one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    /// Direct P2P path
    Direct,
    /// P2P path relayed through another client
    Relay,
    /// Through the central server
    Server,
}

/// One routing decision
#[derive(Debug, Clone)]
pub struct Route {
    pub route_type: RouteType,
    /// 0-100; higher is better
    pub quality: u8,
    pub next_hop: Ipv4Addr,
}

/// Everything known about one peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub tunnel_ip: Ipv4Addr,
    pub public_addr: String,
    pub local_addr: String,
    pub nat_type: NatType,
    pub connected: bool,
    pub through_server: bool,
    pub last_seen: Instant,
}

impl Peer {
    /// A freshly learned peer: not yet connected, reached via server.
    pub fn new(tunnel_ip: Ipv4Addr) -> Self {
        Self {
            tunnel_ip,
            public_addr: String::new(),
            local_addr: String::new(),
            nat_type: NatType::Unknown,
            connected: false,
            through_server: true,
            last_seen: Instant::now(),
        }
    }
}

/// Route statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub total_peers: usize,
    pub direct_routes: usize,
    pub relay_routes: usize,
    pub server_routes: usize,
}

struct Tables {
    peers: HashMap<Ipv4Addr, Peer>,
    routes: HashMap<Ipv4Addr, Route>,
}

/// Thread-safe routing table
pub struct RoutingTable {
    tables: RwLock<Tables>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                peers: HashMap::new(),
                routes: HashMap::new(),
            }),
        }
    }

    /// Insert or refresh a peer and immediately recompute its route.
    pub fn add_peer(&self, peer: Peer) {
        let mut tables = self.tables.write().unwrap();
        let route = route_for(&peer);
        tables.routes.insert(peer.tunnel_ip, route);
        tables.peers.insert(peer.tunnel_ip, peer);
    }

    /// Remove a peer and its route.
    pub fn remove_peer(&self, tunnel_ip: Ipv4Addr) {
        let mut tables = self.tables.write().unwrap();
        tables.peers.remove(&tunnel_ip);
        tables.routes.remove(&tunnel_ip);
    }

    /// Fetch a snapshot of one peer.
    pub fn get_peer(&self, tunnel_ip: Ipv4Addr) -> Option<Peer> {
        self.tables.read().unwrap().peers.get(&tunnel_ip).cloned()
    }

    /// Snapshot of every peer.
    pub fn get_all_peers(&self) -> Vec<Peer> {
        self.tables.read().unwrap().peers.values().cloned().collect()
    }

    /// Current route toward a tunnel IP.
    pub fn get_route(&self, tunnel_ip: Ipv4Addr) -> Option<Route> {
        self.tables.read().unwrap().routes.get(&tunnel_ip).cloned()
    }

    /// Apply a closure to one peer and recompute its route.
    pub fn update_peer<F: FnOnce(&mut Peer)>(&self, tunnel_ip: Ipv4Addr, f: F) -> bool {
        let mut tables = self.tables.write().unwrap();
        let Some(peer) = tables.peers.get_mut(&tunnel_ip) else {
            return false;
        };
        f(peer);
        peer.last_seen = Instant::now();
        let route = route_for(peer);
        tables.routes.insert(tunnel_ip, route);
        true
    }

    /// Recompute every route from current peer state.
    pub fn update_routes(&self) {
        let mut tables = self.tables.write().unwrap();
        let routes: Vec<(Ipv4Addr, Route)> = tables
            .peers
            .values()
            .map(|peer| (peer.tunnel_ip, route_for(peer)))
            .collect();
        for (ip, route) in routes {
            tables.routes.insert(ip, route);
        }
    }

    /// Drop peers that have been silent past the threshold.
    pub fn clean_stale_routes(&self, max_age: Duration) {
        let mut tables = self.tables.write().unwrap();
        let now = Instant::now();
        let stale: Vec<Ipv4Addr> = tables
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen) > max_age)
            .map(|p| p.tunnel_ip)
            .collect();
        for ip in stale {
            debug!("removing stale peer {}", ip);
            tables.peers.remove(&ip);
            tables.routes.remove(&ip);
        }
    }

    /// Aggregate route counts for logging and status output.
    pub fn get_route_stats(&self) -> RouteStats {
        let tables = self.tables.read().unwrap();
        let mut stats = RouteStats {
            total_peers: tables.peers.len(),
            ..Default::default()
        };
        for route in tables.routes.values() {
            match route.route_type {
                RouteType::Direct => stats.direct_routes += 1,
                RouteType::Relay => stats.relay_routes += 1,
                RouteType::Server => stats.server_routes += 1,
            }
        }
        stats
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Score one peer into a route.
///
/// Connected direct peers land in 90-100, connected through-server peers in
/// 50-70, everything else in 20-40. Freshness nudges the score inside each
/// band.
fn route_for(peer: &Peer) -> Route {
    let age = peer.last_seen.elapsed();
    let fresh = age < Duration::from_secs(10);

    let (route_type, quality) = if peer.connected && !peer.through_server {
        (RouteType::Direct, if fresh { 100 } else { 90 })
    } else if peer.connected {
        (RouteType::Relay, if fresh { 70 } else { 50 })
    } else {
        (RouteType::Server, if fresh { 40 } else { 20 })
    };

    Route {
        route_type,
        quality,
        next_hop: peer.tunnel_ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_direct_route_implies_connected() {
        let table = RoutingTable::new();
        let mut peer = Peer::new(ip("10.0.0.3"));
        peer.connected = true;
        peer.through_server = false;
        table.add_peer(peer);

        let route = table.get_route(ip("10.0.0.3")).unwrap();
        assert_eq!(route.route_type, RouteType::Direct);
        assert!((90..=100).contains(&route.quality));
        assert!(table.get_peer(ip("10.0.0.3")).unwrap().connected);
    }

    #[test]
    fn test_relay_and_server_bands() {
        let table = RoutingTable::new();

        let mut relay = Peer::new(ip("10.0.0.4"));
        relay.connected = true;
        relay.through_server = true;
        table.add_peer(relay);

        let server = Peer::new(ip("10.0.0.5"));
        table.add_peer(server);

        let relay_route = table.get_route(ip("10.0.0.4")).unwrap();
        assert_eq!(relay_route.route_type, RouteType::Relay);
        assert!((50..=70).contains(&relay_route.quality));

        let server_route = table.get_route(ip("10.0.0.5")).unwrap();
        assert_eq!(server_route.route_type, RouteType::Server);
        assert!((20..=40).contains(&server_route.quality));
    }

    #[test]
    fn test_demotion_on_update() {
        let table = RoutingTable::new();
        let mut peer = Peer::new(ip("10.0.0.6"));
        peer.connected = true;
        peer.through_server = false;
        table.add_peer(peer);
        assert_eq!(
            table.get_route(ip("10.0.0.6")).unwrap().route_type,
            RouteType::Direct
        );

        table.update_peer(ip("10.0.0.6"), |p| {
            p.connected = false;
            p.through_server = true;
        });
        table.update_routes();
        assert_eq!(
            table.get_route(ip("10.0.0.6")).unwrap().route_type,
            RouteType::Server
        );
    }

    #[test]
    fn test_stale_cleanup() {
        let table = RoutingTable::new();
        let mut old_peer = Peer::new(ip("10.0.0.7"));
        old_peer.last_seen = Instant::now() - Duration::from_secs(120);
        table.add_peer(old_peer);
        table.add_peer(Peer::new(ip("10.0.0.8")));

        table.clean_stale_routes(STALE_ROUTE_TIMEOUT);

        assert!(table.get_peer(ip("10.0.0.7")).is_none());
        assert!(table.get_route(ip("10.0.0.7")).is_none());
        assert!(table.get_peer(ip("10.0.0.8")).is_some());
    }

    #[test]
    fn test_route_stats() {
        let table = RoutingTable::new();

        let mut direct = Peer::new(ip("10.0.0.2"));
        direct.connected = true;
        direct.through_server = false;
        table.add_peer(direct);

        let mut relay = Peer::new(ip("10.0.0.3"));
        relay.connected = true;
        table.add_peer(relay);

        table.add_peer(Peer::new(ip("10.0.0.4")));

        assert_eq!(
            table.get_route_stats(),
            RouteStats {
                total_peers: 3,
                direct_routes: 1,
                relay_routes: 1,
                server_routes: 1,
            }
        );
    }
}

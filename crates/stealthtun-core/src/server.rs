//! Server Pipelines
//!
//! The server accepts many clients, each an independent session with its
//! own send queue, cipher tracking and keepalive. Inbound Data frames are
//! routed to the TUN device or relayed to the destination client; the
//! server also coordinates on-demand P2P setup between clients.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use stealthtun_crypto::Cipher;
use stealthtun_network::faketcp::{FakeTcpConn, FakeTcpListener};
use stealthtun_network::packet::{ipv4, FrameType};
use stealthtun_network::NetworkError;

use crate::error::{CoreError, CoreResult};
use crate::queue::{enqueue_with_timeout, PacketBuf};
use crate::shutdown::Shutdown;
use crate::signaling::{
    control_frame, encode_route_list, parse_route_list, ConfigUpdateMessage, PeerAnnouncement,
    PeerInfoMessage,
};
use crate::tunnel::Tunnel;
use crate::{IDLE_CONNECTION_TIMEOUT, P2P_PEER_INFO_WAIT_SECS};

/// One connected client session on the server
pub(crate) struct ClientConn {
    pub(crate) id: u64,
    pub(crate) conn: Arc<FakeTcpConn>,
    send_tx: mpsc::Sender<PacketBuf>,
    send_rx: AsyncMutex<Option<mpsc::Receiver<PacketBuf>>>,
    tunnel_ip: StdRwLock<Option<Ipv4Addr>>,
    /// Last PeerInfo string announced by this client
    peer_info: StdRwLock<Option<String>>,
    /// Cipher under which this client last decrypted successfully
    cipher: StdRwLock<Option<(Arc<Cipher>, u64)>>,
    last_recv: StdMutex<Instant>,
    pub(crate) shutdown: Shutdown,
}

impl ClientConn {
    fn new(id: u64, conn: Arc<FakeTcpConn>, queue_size: usize) -> Self {
        let (send_tx, send_rx) = mpsc::channel(queue_size);
        Self {
            id,
            conn,
            send_tx,
            send_rx: AsyncMutex::new(Some(send_rx)),
            tunnel_ip: StdRwLock::new(None),
            peer_info: StdRwLock::new(None),
            cipher: StdRwLock::new(None),
            last_recv: StdMutex::new(Instant::now()),
            shutdown: Shutdown::new(),
        }
    }

    pub(crate) fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        *self.tunnel_ip.read().unwrap()
    }

    fn peer_info(&self) -> Option<String> {
        self.peer_info.read().unwrap().clone()
    }

    fn set_cipher(&self, cipher: Arc<Cipher>, generation: u64) {
        *self.cipher.write().unwrap() = Some((cipher, generation));
    }

    fn cipher(&self) -> Option<(Arc<Cipher>, u64)> {
        self.cipher.read().unwrap().clone()
    }

    fn touch(&self) {
        *self.last_recv.lock().unwrap() = Instant::now();
    }

    fn idle_duration(&self) -> Duration {
        self.last_recv.lock().unwrap().elapsed()
    }

    /// Stop this session: close the socket first to unblock I/O, then
    /// signal the per-client tasks.
    pub(crate) fn stop(&self) {
        self.conn.close();
        self.shutdown.trigger();
    }
}

impl Tunnel {
    /// Bind the listener and launch the server pipelines.
    pub(crate) async fn start_server(&self) -> CoreResult<()> {
        let local_addr = {
            let cfg = self.config.read().unwrap();
            cfg.local_addr.clone()
        };
        let local = local_addr
            .parse()
            .map_err(|_| CoreError::ConfigInvalid(format!("bad local_addr: {}", local_addr)))?;

        let listener = Arc::new(FakeTcpListener::bind(local)?);
        *self.listener.write().unwrap() = Some(listener.clone());

        let this = self.upgrade_self_server()?;

        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_tun_reader_server().await });

        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_accept_loop(listener).await });

        let (multi_client, max_clients, isolation, push_interval) = {
            let cfg = self.config.read().unwrap();
            (
                cfg.multi_client(),
                cfg.max_clients,
                cfg.client_isolation,
                cfg.config_push_interval,
            )
        };

        if multi_client {
            info!("multi-client mode enabled (max {} clients)", max_clients);
            if isolation {
                info!("client isolation enabled: no client-to-client forwarding");
            }
        }

        if push_interval > 0 && self.ciphers.has_cipher() {
            let tunnel = this.clone();
            self.spawn_task(async move { tunnel.run_config_push_loop().await });
        }

        Ok(())
    }

    fn upgrade_self_server(&self) -> CoreResult<Arc<Self>> {
        self.upgrade_self().ok_or(CoreError::Stopping)
    }

    // =====================
    // Accept loop and session lifecycle
    // =====================

    async fn run_accept_loop(self: Arc<Self>, listener: Arc<FakeTcpListener>) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }

            let conn = match listener.accept().await {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    if !self.shutdown.is_triggered() {
                        warn!("accept error, stopping tunnel: {}", e);
                        // A dead listener means no new sessions; wind down.
                        self.shutdown.trigger();
                    }
                    return;
                }
            };

            let (multi_client, max_clients, queue_size) = {
                let cfg = self.config.read().unwrap();
                (cfg.multi_client(), cfg.max_clients, cfg.send_queue_size)
            };
            let client_count = self.clients.read().unwrap().len();

            if !multi_client && client_count >= 1 {
                info!(
                    "single-client mode: rejecting connection from {}",
                    conn.remote_addr()
                );
                conn.close();
                continue;
            }
            if client_count >= max_clients {
                info!(
                    "max clients reached ({}), rejecting connection from {}",
                    max_clients,
                    conn.remote_addr()
                );
                conn.close();
                continue;
            }

            let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
            let client = Arc::new(ClientConn::new(id, conn, queue_size));

            let tunnel = self.clone();
            tokio::spawn(async move { tunnel.handle_client(client).await });
        }
    }

    async fn handle_client(self: Arc<Self>, client: Arc<ClientConn>) {
        info!("client connected: {}", client.conn.remote_addr());
        self.all_clients
            .write()
            .unwrap()
            .insert(client.id, client.clone());

        if self.config.read().unwrap().p2p_enabled {
            self.send_public_addr(&client).await;
        }
        self.send_routes_to_client(&client).await;

        let reader = {
            let tunnel = self.clone();
            let client = client.clone();
            tokio::spawn(async move { tunnel.run_client_reader(client).await })
        };
        let writer = {
            let tunnel = self.clone();
            let client = client.clone();
            tokio::spawn(async move { tunnel.run_client_writer(client).await })
        };
        let keepalive = {
            let tunnel = self.clone();
            let client = client.clone();
            tokio::spawn(async move { tunnel.run_client_keepalive(client).await })
        };

        let _ = reader.await;
        let _ = writer.await;
        let _ = keepalive.await;

        self.all_clients.write().unwrap().remove(&client.id);
        self.remove_client(&client).await;
        info!("client disconnected: {}", client.conn.remote_addr());
    }

    /// Bind a tunnel IP to a client record, evicting any previous owner.
    fn add_client(&self, client: &Arc<ClientConn>, tunnel_ip: Ipv4Addr) {
        let evicted = {
            let mut clients = self.clients.write().unwrap();
            let evicted = clients.insert(tunnel_ip, client.clone());
            *client.tunnel_ip.write().unwrap() = Some(tunnel_ip);
            info!(
                "client registered with tunnel IP {} (total {})",
                tunnel_ip,
                clients.len()
            );
            evicted
        };

        if let Some(old) = evicted {
            if !Arc::ptr_eq(&old, client) {
                warn!("tunnel IP conflict on {}, evicting previous client", tunnel_ip);
                old.stop();
            }
        }
    }

    async fn remove_client(&self, client: &Arc<ClientConn>) {
        client.stop();

        let Some(tunnel_ip) = client.tunnel_ip() else {
            return;
        };

        {
            let mut clients = self.clients.write().unwrap();
            // A replacement client may already own this IP.
            if clients
                .get(&tunnel_ip)
                .map(|current| Arc::ptr_eq(current, client))
                .unwrap_or(false)
            {
                clients.remove(&tunnel_ip);
                info!(
                    "client {} unregistered (remaining {})",
                    tunnel_ip,
                    clients.len()
                );
            }
        }

        if let Some(routing) = &self.routing {
            routing.remove_peer(tunnel_ip);
        }
        self.cleanup_client_routes(client).await;

        if self.config.read().unwrap().p2p_enabled {
            self.broadcast_peer_disconnect(tunnel_ip).await;
        }
    }

    /// Tell the surviving clients that a peer left so they drop its routes.
    async fn broadcast_peer_disconnect(&self, disconnected: Ipv4Addr) {
        let message = PeerInfoMessage::Disconnect(disconnected);
        let frame = control_frame(FrameType::PeerInfo, message.encode().as_bytes());

        let targets: Vec<Arc<ClientConn>> = {
            let clients = self.clients.read().unwrap();
            clients
                .values()
                .filter(|c| c.tunnel_ip() != Some(disconnected))
                .cloned()
                .collect()
        };

        for client in targets {
            if let Err(e) = self.send_frame_to_client(&client, &frame).await {
                debug!("failed to notify {:?}: {}", client.tunnel_ip(), e);
            }
        }
    }

    fn client_by_ip(&self, tunnel_ip: Ipv4Addr) -> Option<Arc<ClientConn>> {
        self.clients.read().unwrap().get(&tunnel_ip).cloned()
    }

    // =====================
    // Per-client pipelines
    // =====================

    /// Per-client network reader: open, register, dispatch.
    async fn run_client_reader(self: Arc<Self>, client: Arc<ClientConn>) {
        client.touch();

        loop {
            if self.shutdown.is_triggered() || client.shutdown.is_triggered() {
                return;
            }

            if client.idle_duration() > IDLE_CONNECTION_TIMEOUT {
                info!(
                    "client {} idle for over {:?}, disconnecting",
                    client.conn.remote_addr(),
                    IDLE_CONNECTION_TIMEOUT
                );
                client.stop();
                return;
            }

            let packet = match client.conn.read_packet().await {
                Ok(p) => p,
                Err(NetworkError::Timeout) => continue,
                Err(e) => {
                    if !self.shutdown.is_triggered() && !client.shutdown.is_triggered() {
                        debug!("client read error from {}: {}", client.conn.remote_addr(), e);
                    }
                    client.stop();
                    return;
                }
            };

            if packet.is_empty() {
                continue;
            }
            client.touch();

            let (plain, used_cipher) = match self.open_frame(&packet) {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        "client decryption error from {} (wrong key?): {}",
                        client.conn.remote_addr(),
                        e
                    );
                    continue;
                }
            };
            if let Some((cipher, generation)) = used_cipher {
                client.set_cipher(cipher, generation);
            }

            if plain.is_empty() {
                continue;
            }
            let Ok(frame_type) = FrameType::try_from(plain[0]) else {
                continue;
            };
            let payload = &plain[1..];

            match frame_type {
                FrameType::Data => self.handle_client_data(&client, payload).await,
                FrameType::Keepalive => {
                    // touch() above already reset the idle timer.
                }
                FrameType::PeerInfo => self.handle_client_peer_info(&client, payload),
                FrameType::P2pRequest => self.handle_p2p_request(&client, payload),
                FrameType::RouteInfo => {
                    let routes = parse_route_list(&String::from_utf8_lossy(payload));
                    if !routes.is_empty() {
                        self.register_client_routes(&client, &routes).await;
                        self.send_routes_to_client(&client).await;
                    }
                }
                _ => {
                    trace!("unexpected frame type {:?} from client", frame_type);
                }
            }
        }
    }

    /// Data frame from a client: register its tunnel IP, then deliver to
    /// the TUN device or relay to the destination client.
    async fn handle_client_data(&self, client: &Arc<ClientConn>, payload: &[u8]) {
        if payload.len() < ipv4::MIN_HEADER_LEN || !ipv4::is_ipv4(payload) {
            return;
        }
        let Some(src) = ipv4::source(payload) else {
            return;
        };

        match client.tunnel_ip() {
            None => {
                // First Data packet binds the client to its tunnel IP.
                self.add_client(client, src);
            }
            Some(registered) if registered != src => {
                warn!(
                    "client {} sent packet with source {} (registered {}), dropping",
                    client.conn.remote_addr(),
                    src,
                    registered
                );
                return;
            }
            Some(_) => {}
        }

        let Some(dst) = ipv4::destination(payload) else {
            return;
        };

        let isolation = self.config.read().unwrap().client_isolation;
        if isolation {
            // Clients may only talk to the server side.
            self.deliver_to_tun(payload).await;
            return;
        }

        if let Some(target) = self.client_by_ip(dst) {
            if !Arc::ptr_eq(&target, client) {
                self.relay_to_client(&target, payload, dst).await;
                return;
            }
        }

        self.deliver_to_tun(payload).await;
    }

    async fn deliver_to_tun(&self, payload: &[u8]) {
        match self.write_tun(payload).await {
            Ok(()) => {}
            Err(CoreError::Network(NetworkError::NoBufferSpace)) => {
                trace!("server TUN write buffer full, dropping packet");
            }
            Err(e) => {
                if !self.shutdown.is_triggered() {
                    warn!("server TUN write error: {}", e);
                }
            }
        }
    }

    /// Server relay: copy into a pooled buffer and queue toward the target
    /// client.
    async fn relay_to_client(&self, target: &Arc<ClientConn>, payload: &[u8], dst: Ipv4Addr) {
        let Some(buf) = self.pool.acquire_from(payload) else {
            return;
        };
        if !enqueue_with_timeout(&target.send_tx, buf, &target.shutdown).await
            && !self.shutdown.is_triggered()
        {
            trace!("relay queue full for {}, dropping packet", dst);
        }
    }

    /// Per-client network writer: send queue -> seal with the client's
    /// cipher -> socket.
    async fn run_client_writer(self: Arc<Self>, client: Arc<ClientConn>) {
        let mut rx = match client.send_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let mut buf = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(p) => p,
                    None => return,
                },
                _ = client.shutdown.wait() => return,
                _ = self.shutdown.wait() => return,
            };

            if !buf.prepend(FrameType::Data as u8) {
                warn!("packet buffer headroom exhausted, dropping packet");
                continue;
            }

            let sealed = match self.seal_for_client(&client, &buf) {
                Ok(s) => s,
                Err(e) => {
                    warn!("client encryption error: {}", e);
                    continue;
                }
            };
            drop(buf);

            if let Err(e) = client.conn.write_packet(&sealed).await {
                if !self.shutdown.is_triggered() && !client.shutdown.is_triggered() {
                    debug!(
                        "client write error to {}: {}",
                        client.conn.remote_addr(),
                        e
                    );
                }
                client.stop();
                return;
            }
        }
    }

    /// Per-client keepalive at the tunnel cadence.
    async fn run_client_keepalive(self: Arc<Self>, client: Arc<ClientConn>) {
        let interval = Duration::from_secs(self.config.read().unwrap().keepalive_interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = client.shutdown.wait() => return,
                _ = self.shutdown.wait() => return,
            }

            let frame = [FrameType::Keepalive as u8];
            let sealed = match self.seal_for_client(&client, &frame) {
                Ok(s) => s,
                Err(e) => {
                    warn!("client keepalive encryption error: {}", e);
                    continue;
                }
            };

            if let Err(e) = client.conn.write_packet(&sealed).await {
                if !self.shutdown.is_triggered() && !client.shutdown.is_triggered() {
                    debug!(
                        "client keepalive error to {}: {}",
                        client.conn.remote_addr(),
                        e
                    );
                }
                client.stop();
                return;
            }
        }
    }

    /// Seal a frame for one client, preferring the cipher generation that
    /// the client itself last used.
    fn seal_for_client(&self, client: &ClientConn, frame: &[u8]) -> CoreResult<Vec<u8>> {
        if self.classifier.should_skip_encryption(frame) {
            return Ok(frame.to_vec());
        }
        if let Some((cipher, _)) = client.cipher() {
            return Ok(cipher.encrypt(frame)?);
        }
        Ok(self.ciphers.seal(frame)?)
    }

    async fn send_frame_to_client(&self, client: &Arc<ClientConn>, frame: &[u8]) -> CoreResult<()> {
        let sealed = self.seal_for_client(client, frame)?;
        client.conn.write_packet(&sealed).await?;
        Ok(())
    }

    // =====================
    // Server TUN reader
    // =====================

    /// Route frames read from the server's TUN device toward clients.
    async fn run_tun_reader_server(self: Arc<Self>) {
        debug!("server TUN reader started");

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let Some(tun) = self.tun_device() else {
                sleep(Duration::from_millis(100)).await;
                continue;
            };

            let packet = tokio::select! {
                result = tun.read() => result,
                _ = self.shutdown.wait() => break,
            };

            let packet = match packet {
                Ok(p) => p,
                Err(NetworkError::NoBufferSpace) => continue,
                Err(e) => {
                    if !self.shutdown.is_triggered() {
                        warn!("server TUN read error, stopping tunnel: {}", e);
                        // The interface is gone; wind the tunnel down.
                        self.shutdown.trigger();
                    }
                    break;
                }
            };

            if packet.len() < ipv4::MIN_HEADER_LEN || !ipv4::is_ipv4(&packet) {
                continue;
            }
            let Some(dst) = ipv4::destination(&packet) else {
                continue;
            };

            let Some(target) = self.route_tun_packet(dst) else {
                continue;
            };

            let Some(buf) = self.pool.acquire_from(&packet) else {
                continue;
            };
            if !enqueue_with_timeout(&target.send_tx, buf, &target.shutdown).await
                && !self.shutdown.is_triggered()
            {
                trace!("send queue full for {}, dropping TUN packet", dst);
            }
        }

        debug!("server TUN reader stopped");
    }

    /// Pick the client that owns a TUN packet's destination, or `None` to
    /// drop it.
    ///
    /// Packets addressed to the server's own tunnel IP can only be a
    /// routing loop and are always dropped; client isolation additionally
    /// blocks kernel-routed client-to-client traffic.
    fn route_tun_packet(&self, dst: Ipv4Addr) -> Option<Arc<ClientConn>> {
        if dst == self.my_tunnel_ip {
            warn!("dropping TUN packet addressed to the server itself ({})", dst);
            return None;
        }

        let isolation = self.config.read().unwrap().client_isolation;
        if isolation && self.client_by_ip(dst).is_some() {
            trace!("client isolation: dropping TUN packet for client {}", dst);
            return None;
        }

        let target = self
            .client_by_ip(dst)
            .or_else(|| self.find_route_client(dst));
        if target.is_none() {
            trace!("no client for TUN packet to {}, dropping", dst);
        }
        target
    }

    // =====================
    // Advertised client routes
    // =====================

    async fn register_client_routes(&self, client: &Arc<ClientConn>, routes: &[String]) {
        let mut accepted = Vec::new();
        {
            let mut index = self.client_route_index.write().unwrap();
            index.retain(|(_, owner)| *owner != client.id);

            for route in routes {
                match route.parse::<ipnet::Ipv4Net>() {
                    Ok(net) => {
                        index.push((net, client.id));
                        accepted.push(route.clone());
                    }
                    Err(e) => debug!("invalid advertised route {}: {}", route, e),
                }
            }
        }

        info!(
            "registered {} advertised route(s) from {:?}",
            accepted.len(),
            client.tunnel_ip()
        );
        self.apply_peer_routes(&accepted).await;
    }

    async fn cleanup_client_routes(&self, client: &Arc<ClientConn>) {
        let removed: Vec<ipnet::Ipv4Net> = {
            let mut index = self.client_route_index.write().unwrap();
            let removed = index
                .iter()
                .filter(|(_, owner)| *owner == client.id)
                .map(|(net, _)| *net)
                .collect();
            index.retain(|(_, owner)| *owner != client.id);
            removed
        };

        let tun_name = self.tun_name.read().unwrap().clone();
        for net in removed {
            crate::netcfg::delete_route(&tun_name, &net.to_string()).await;
        }
    }

    fn find_route_client(&self, dst: Ipv4Addr) -> Option<Arc<ClientConn>> {
        let owner = {
            let index = self.client_route_index.read().unwrap();
            index
                .iter()
                .find(|(net, _)| net.contains(&dst))
                .map(|(_, owner)| *owner)
        }?;
        self.all_clients.read().unwrap().get(&owner).cloned()
    }

    async fn send_routes_to_client(&self, client: &Arc<ClientConn>) {
        let routes = self.advertised_routes();
        if routes.is_empty() {
            return;
        }

        let payload = encode_route_list(&routes);
        let frame = control_frame(FrameType::RouteInfo, payload.as_bytes());
        if let Err(e) = self.send_frame_to_client(client, &frame).await {
            debug!("failed to send routes to client: {}", e);
        }
    }

    // =====================
    // P2P coordination
    // =====================

    /// Tell a freshly accepted client which public address it connected
    /// from, so it can announce NAT-correct endpoints.
    async fn send_public_addr(&self, client: &Arc<ClientConn>) {
        let public = client.conn.remote_addr().to_string();
        let frame = control_frame(FrameType::PublicAddr, public.as_bytes());

        if let Err(e) = self.send_frame_to_client(client, &frame).await {
            warn!("failed to send public address to client: {}", e);
            client.stop();
            return;
        }
        debug!("sent public address {} to client", public);
    }

    /// Store a client's announced P2P endpoints (no broadcast; P2P is
    /// established on demand).
    fn handle_client_peer_info(&self, client: &Arc<ClientConn>, payload: &[u8]) {
        if !self.config.read().unwrap().p2p_enabled {
            return;
        }

        let text = String::from_utf8_lossy(payload).to_string();
        let Some(PeerInfoMessage::Announce(announcement)) = PeerInfoMessage::parse(&text) else {
            return;
        };

        if client.tunnel_ip().is_none() {
            self.add_client(client, announcement.tunnel_ip);
        }

        *client.peer_info.write().unwrap() = Some(text);
        debug!(
            "stored peer info for {}, ready for on-demand P2P",
            announcement.tunnel_ip
        );
    }

    /// A client asked for a direct path to another client: wait for both
    /// peer-info records if needed, pick the initiator, then send PeerInfo
    /// and Punch to both sides.
    fn handle_p2p_request(&self, requester: &Arc<ClientConn>, payload: &[u8]) {
        if !self.config.read().unwrap().p2p_enabled {
            return;
        }

        let target_text = String::from_utf8_lossy(payload).to_string();
        let Ok(target_ip) = target_text.parse::<Ipv4Addr>() else {
            debug!("invalid P2P request target: {}", target_text);
            return;
        };

        let Some(requester_ip) = requester.tunnel_ip() else {
            debug!("P2P request from unregistered client, ignoring");
            return;
        };
        let Some(target) = self.client_by_ip(target_ip) else {
            debug!("P2P request for unknown target {}, ignoring", target_ip);
            return;
        };

        let Some(tunnel) = self.upgrade_self() else {
            return;
        };
        let requester = requester.clone();
        self.spawn_task(async move {
            // Peer info usually arrives right after NAT detection; poll for
            // a bounded interval before giving up.
            for _ in 0..P2P_PEER_INFO_WAIT_SECS {
                let requester_info = requester.peer_info();
                let target_info = target.peer_info();

                if let (Some(req_info), Some(tgt_info)) = (requester_info, target_info) {
                    tunnel
                        .coordinate_p2p(&requester, &target, &req_info, &tgt_info)
                        .await;
                    return;
                }

                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => {}
                    _ = tunnel.shutdown.wait() => return,
                }
            }
            info!(
                "timed out waiting for peer info ({} <-> {})",
                requester_ip, target_ip
            );
        });
    }

    /// Pick the punch initiator per NAT level (ties: lower P2P port, then
    /// lower last tunnel-IP octet) and fan out PeerInfo + Punch.
    async fn coordinate_p2p(
        &self,
        requester: &Arc<ClientConn>,
        target: &Arc<ClientConn>,
        requester_info: &str,
        target_info: &str,
    ) {
        let req_ann = match PeerInfoMessage::parse(requester_info) {
            Some(PeerInfoMessage::Announce(a)) => a,
            _ => return,
        };
        let tgt_ann = match PeerInfoMessage::parse(target_info) {
            Some(PeerInfoMessage::Announce(a)) => a,
            _ => return,
        };

        let requester_initiates = punch_initiator_is_first(&req_ann, &tgt_ann);
        let (initiator, responder, initiator_sees, responder_sees) = if requester_initiates {
            (requester, target, target_info, requester_info)
        } else {
            (target, requester, requester_info, target_info)
        };

        info!(
            "coordinating P2P: {} initiates toward {}",
            initiator.tunnel_ip().map_or_else(|| "?".into(), |ip| ip.to_string()),
            responder.tunnel_ip().map_or_else(|| "?".into(), |ip| ip.to_string()),
        );

        self.send_peer_info_and_punch(initiator, initiator_sees).await;
        self.send_peer_info_and_punch(responder, responder_sees).await;
    }

    async fn send_peer_info_and_punch(&self, client: &Arc<ClientConn>, peer_info: &str) {
        let info_frame = control_frame(FrameType::PeerInfo, peer_info.as_bytes());
        if let Err(e) = self.send_frame_to_client(client, &info_frame).await {
            debug!("failed to send peer info: {}", e);
            return;
        }

        let punch_frame = control_frame(FrameType::Punch, peer_info.as_bytes());
        if let Err(e) = self.send_frame_to_client(client, &punch_frame).await {
            debug!("failed to send punch frame: {}", e);
        }
    }

    // =====================
    // Key rotation push
    // =====================

    async fn run_config_push_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.read().unwrap().config_push_interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => return,
            }

            if let Err(e) = self.push_config_update().await {
                warn!("config push failed: {}", e);
            }
        }
    }

    /// Generate a fresh key, push it (and the advertised routes) to every
    /// tracked client, then rotate our own cipher. The previous cipher
    /// stays valid for the grace window so in-flight traffic survives.
    async fn push_config_update(&self) -> CoreResult<()> {
        if !self.ciphers.has_cipher() {
            return Ok(());
        }

        let new_key = stealthtun_crypto::generate_rotation_key();
        let message = ConfigUpdateMessage {
            key: new_key.clone(),
            routes: Some(self.advertised_routes()),
        };
        let payload =
            serde_json::to_vec(&message).map_err(|e| CoreError::Fatal(e.to_string()))?;
        let frame = control_frame(FrameType::ConfigUpdate, &payload);

        let clients: Vec<Arc<ClientConn>> =
            self.all_clients.read().unwrap().values().cloned().collect();

        for client in &clients {
            if let Err(e) = self.send_frame_to_client(client, &frame).await {
                warn!("failed to push config update to client: {}", e);
            }
        }

        self.rotate_cipher(&new_key)?;
        info!(
            "rotated tunnel key and pushed config to {} client(s)",
            clients.len()
        );
        Ok(())
    }
}

/// Initiator selection for a coordinated punch: the first announcement's
/// side initiates when it has the harder NAT; ties break toward the lower
/// P2P port and then the lower last tunnel-IP octet.
fn punch_initiator_is_first(first: &PeerAnnouncement, second: &PeerAnnouncement) -> bool {
    crate::tunnel::should_initiate_punch(
        first.nat_type,
        first.p2p_port().unwrap_or(0),
        first.tunnel_ip,
        second.nat_type,
        second.p2p_port(),
        second.tunnel_ip,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tunnel::Tunnel;
    use stealthtun_network::nat::NatType;

    fn server_tunnel() -> Arc<Tunnel> {
        let config: Config = serde_json::from_str(
            r#"{
  "mode": "server",
  "local_addr": "0.0.0.0:9000",
  "tunnel_addr": "10.0.0.1/24"
}"#,
        )
        .unwrap();
        Tunnel::new(config, None).unwrap()
    }

    #[test]
    fn test_tun_packet_to_own_ip_is_dropped() {
        let tunnel = server_tunnel();

        // A packet destined to the server's own tunnel IP is a routing
        // loop and never forwarded.
        assert!(tunnel.route_tun_packet("10.0.0.1".parse().unwrap()).is_none());

        // An unknown destination simply has no owner.
        assert!(tunnel.route_tun_packet("10.0.0.50".parse().unwrap()).is_none());
    }

    fn ann(ip: &str, port: u16, nat: NatType) -> PeerAnnouncement {
        PeerAnnouncement {
            tunnel_ip: ip.parse().unwrap(),
            public_addr: format!("203.0.113.1:{}", port),
            local_addr: format!("192.168.0.2:{}", port),
            nat_type: nat,
        }
    }

    #[test]
    fn test_harder_nat_side_initiates() {
        let requester = ann("10.0.0.2", 4000, NatType::Symmetric);
        let target = ann("10.0.0.3", 5000, NatType::FullCone);
        assert!(punch_initiator_is_first(&requester, &target));

        let requester = ann("10.0.0.2", 4000, NatType::FullCone);
        let target = ann("10.0.0.3", 5000, NatType::Symmetric);
        assert!(!punch_initiator_is_first(&requester, &target));
    }

    #[test]
    fn test_tie_breaks() {
        // Same NAT level: lower port initiates.
        let a = ann("10.0.0.2", 4000, NatType::RestrictedCone);
        let b = ann("10.0.0.3", 5000, NatType::RestrictedCone);
        assert!(punch_initiator_is_first(&a, &b));
        assert!(!punch_initiator_is_first(&b, &a));

        // Same port too: lower last octet initiates.
        let a = ann("10.0.0.2", 4000, NatType::RestrictedCone);
        let b = ann("10.0.0.9", 4000, NatType::RestrictedCone);
        assert!(punch_initiator_is_first(&a, &b));
        assert!(!punch_initiator_is_first(&b, &a));
    }
}

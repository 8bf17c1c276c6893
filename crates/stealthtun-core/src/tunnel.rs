//! Tunnel Engine
//!
//! Owns the virtual interface, the fake-TCP sockets, the cipher state and
//! the P2P control plane, and runs the packet pipelines for both modes.
//!
//! Client mode: TUN reader -> send queue -> seal -> fake-TCP (or a direct
//! P2P path), and fake-TCP -> open -> dispatch -> recv queue -> TUN writer,
//! plus keepalive, reconnection and route maintenance tasks. The server
//! pipelines live in [`crate::server`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use stealthtun_crypto::{Cipher, CipherSet, OVERHEAD};
use stealthtun_network::faketcp::{check_raw_socket_support, FakeTcpConn, FakeTcpListener};
use stealthtun_network::fec::Fec;
use stealthtun_network::nat::{p2p_feasible, NatType};
use stealthtun_network::p2p::{P2pManager, PeerEndpoint};
use stealthtun_network::packet::{ipv4, FrameType};
use stealthtun_network::routing::{Peer, RoutingTable};
use stealthtun_network::tun::{create_tun, is_safe_tun_name, TunConfig, TunDevice};
use stealthtun_network::NetworkError;

use crate::config::{peer_tunnel_ip, Config, Mode};
use crate::error::{CoreError, CoreResult};
use crate::passthrough::{is_plain_passthrough, FlowClassifier};
use crate::queue::{enqueue_with_timeout, PacketBuf, PacketPool};
use crate::server::ClientConn;
use crate::shutdown::Shutdown;
use crate::signaling::{
    control_frame, encode_route_list, parse_route_list, ConfigUpdateMessage, PeerAnnouncement,
    PeerInfoMessage,
};
use crate::{
    IDLE_BACKPRESSURE_EXTENSION, IDLE_CONNECTION_TIMEOUT, MAX_RECONNECT_BACKOFF_SECS,
    P2P_REANNOUNCE_RETRIES, P2P_REQUEST_INTERVAL, STOP_DRAIN_TIMEOUT, TUN_WRITE_RETRIES,
};

/// Delay before acting on fresh peer info, so both sides finish registering
const P2P_REGISTRATION_DELAY: Duration = Duration::from_millis(100);

/// Time allowed for a hole punch before routes are re-evaluated
const P2P_HANDSHAKE_WAIT: Duration = Duration::from_secs(2);

/// Wait for the server to resend our public address after a reconnect
const P2P_RECONNECT_ANNOUNCE_DELAY: Duration = Duration::from_secs(2);

/// The tunnel engine. One instance per process, client or server.
pub struct Tunnel {
    pub(crate) config: StdRwLock<Config>,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) mode: Mode,
    pub(crate) my_tunnel_ip: Ipv4Addr,

    pub(crate) ciphers: CipherSet,
    pub(crate) classifier: FlowClassifier,
    #[allow(dead_code)]
    pub(crate) fec: Fec,
    pub(crate) pool: PacketPool,
    pub(crate) shutdown: Shutdown,
    stopped: AtomicBool,

    tun: StdRwLock<Option<Arc<dyn TunDevice>>>,
    pub(crate) tun_name: StdRwLock<String>,

    // Client-mode state
    conn: AsyncMutex<Option<Arc<FakeTcpConn>>>,
    send_tx: Option<mpsc::Sender<PacketBuf>>,
    send_rx: AsyncMutex<Option<mpsc::Receiver<PacketBuf>>>,
    recv_tx: Option<mpsc::Sender<PacketBuf>>,
    recv_rx: AsyncMutex<Option<mpsc::Receiver<PacketBuf>>>,
    last_recv: StdMutex<Instant>,
    public_addr: StdRwLock<Option<String>>,
    pub(crate) server_tunnel_ip: Option<Ipv4Addr>,
    pub(crate) p2p: Option<Arc<P2pManager>>,
    pub(crate) routing: Option<Arc<RoutingTable>>,
    pending_p2p: StdMutex<HashMap<Ipv4Addr, Instant>>,

    // Server-mode state
    pub(crate) listener: StdRwLock<Option<Arc<FakeTcpListener>>>,
    pub(crate) clients: StdRwLock<HashMap<Ipv4Addr, Arc<ClientConn>>>,
    pub(crate) all_clients: StdRwLock<HashMap<u64, Arc<ClientConn>>>,
    pub(crate) client_route_index: StdRwLock<Vec<(ipnet::Ipv4Net, u64)>>,
    pub(crate) next_client_id: AtomicU64,

    tasks: StdMutex<Vec<JoinHandle<()>>>,

    /// Back-reference so `&self` paths can spawn tracked tasks
    weak_self: std::sync::Weak<Self>,
}

impl Tunnel {
    /// Build a tunnel from a validated configuration.
    ///
    /// `config_path` is kept so rotated keys can be persisted back to the
    /// file.
    pub fn new(mut config: Config, config_path: Option<PathBuf>) -> CoreResult<Arc<Self>> {
        // The raw fake-TCP carrier is the only supported transport.
        config.transport = "rawtcp".to_string();
        config.validate()?;

        let ciphers = CipherSet::new(if config.key.is_empty() {
            None
        } else {
            Some(config.key.as_str())
        })?;
        if ciphers.has_cipher() {
            info!("encryption enabled (AES-256-GCM)");
        }

        config.resolve_mtu(ciphers.has_cipher().then_some(OVERHEAD));

        let shard_size = (config.mtu / config.fec_data_shards).max(1);
        let fec = Fec::new(config.fec_data_shards, config.fec_parity_shards, shard_size)?;

        let my_tunnel_ip = config.tunnel_ip()?;
        let pool = PacketPool::new(config.mtu);

        let mode = config.mode;
        let mut p2p = None;
        let mut routing = None;
        let mut server_tunnel_ip = None;

        if mode == Mode::Client {
            server_tunnel_ip = match peer_tunnel_ip(&config.tunnel_addr) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!("cannot derive server tunnel IP: {}", e);
                    None
                }
            };
            if config.p2p_enabled {
                let manager = Arc::new(P2pManager::new(my_tunnel_ip, config.p2p_port));
                manager
                    .set_keepalive_interval(Duration::from_secs(config.p2p_keepalive_interval));
                p2p = Some(manager);
                routing = Some(Arc::new(RoutingTable::new()));
            }
        } else if config.enable_mesh_routing {
            routing = Some(Arc::new(RoutingTable::new()));
        }

        let (send_tx, send_rx, recv_tx, recv_rx) = if mode == Mode::Client {
            let (stx, srx) = mpsc::channel(config.send_queue_size);
            let (rtx, rrx) = mpsc::channel(config.recv_queue_size);
            (Some(stx), Some(srx), Some(rtx), Some(rrx))
        } else {
            (None, None, None, None)
        };

        let tunnel = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config: StdRwLock::new(config),
            config_path,
            mode,
            my_tunnel_ip,
            ciphers,
            classifier: FlowClassifier::new(),
            fec,
            pool,
            shutdown: Shutdown::new(),
            stopped: AtomicBool::new(false),
            tun: StdRwLock::new(None),
            tun_name: StdRwLock::new(String::new()),
            conn: AsyncMutex::new(None),
            send_tx,
            send_rx: AsyncMutex::new(send_rx),
            recv_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            last_recv: StdMutex::new(Instant::now()),
            public_addr: StdRwLock::new(None),
            server_tunnel_ip,
            p2p,
            routing,
            pending_p2p: StdMutex::new(HashMap::new()),
            listener: StdRwLock::new(None),
            clients: StdRwLock::new(HashMap::new()),
            all_clients: StdRwLock::new(HashMap::new()),
            client_route_index: StdRwLock::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            tasks: StdMutex::new(Vec::new()),
        });

        // Seed the routing table with the server so route stats are
        // meaningful before any peer info arrives.
        if let (Some(routing), Some(server_ip)) = (&tunnel.routing, tunnel.server_tunnel_ip) {
            routing.add_peer(Peer::new(server_ip));
        }

        Ok(tunnel)
    }

    /// Start the tunnel: create the interface, connect or listen, and
    /// launch the pipelines.
    pub async fn start(&self) -> CoreResult<()> {
        check_raw_socket_support()?;

        let (tunnel_addr, tun_name, mtu) = {
            let cfg = self.config.read().unwrap();
            (cfg.tunnel_addr.clone(), cfg.tun_name.clone(), cfg.mtu)
        };

        // Unsafe names fall back to a kernel-assigned one.
        let requested_name = if is_safe_tun_name(&tun_name) {
            tun_name
        } else {
            warn!("unsafe TUN name {:?}, using kernel-assigned name", tun_name);
            String::new()
        };

        let device = create_tun(TunConfig {
            name: requested_name,
            mtu: mtu as u16,
        })
        .await
        .map_err(|e| CoreError::InterfaceUnavailable(e.to_string()))?;

        let name = device.name().to_string();
        *self.tun_name.write().unwrap() = name.clone();
        *self.tun.write().unwrap() = Some(Arc::from(device));

        // Addressing goes through the OS command surface; failures are
        // reported but do not abort startup.
        if let Err(e) = crate::netcfg::configure_interface(&name, &tunnel_addr, mtu).await {
            warn!("interface configuration failed: {}", e);
        }

        match self.mode {
            Mode::Client => self.start_client().await?,
            Mode::Server => self.start_server().await?,
        }

        info!(
            "tunnel started in {} mode on {}",
            match self.mode {
                Mode::Client => "client",
                Mode::Server => "server",
            },
            name
        );
        Ok(())
    }

    async fn start_client(&self) -> CoreResult<()> {
        // Initial dial; later failures reconnect with backoff.
        let conn = self.dial_server().await?;
        *self.conn.lock().await = Some(conn);

        let this = self.upgrade_self().ok_or(CoreError::Stopping)?;

        if let Some(p2p) = &self.p2p {
            p2p.clone().start().await?;

            let (p2p_tx, p2p_rx) = mpsc::channel(256);
            p2p.set_packet_handler(p2p_tx);
            let tunnel = this.clone();
            self.spawn_task(async move { tunnel.run_p2p_dispatch(p2p_rx).await });

            let tunnel = this.clone();
            self.spawn_task(async move { tunnel.run_route_update_loop().await });
            info!("P2P enabled on UDP port {}", p2p.local_port());
        }

        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_tun_reader().await });
        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_tun_writer().await });
        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_net_reader().await });
        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_net_writer().await });
        let tunnel = this.clone();
        self.spawn_task(async move { tunnel.run_keepalive().await });

        if !self.advertised_routes().is_empty() {
            let tunnel = this.clone();
            self.spawn_task(async move { tunnel.run_route_advert_loop().await });
        }

        Ok(())
    }

    /// Stop the tunnel. Idempotent; waits up to five seconds for the
    /// pipelines to drain before returning.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.trigger();

        // Closing the device and sockets first unblocks pending I/O.
        let tun = self.tun.write().unwrap().take();
        if let Some(tun) = tun {
            let _ = tun.close().await;
        }

        let listener = self.listener.read().unwrap().clone();
        if let Some(listener) = listener {
            listener.close();
        }

        self.drop_connection().await;

        let clients: Vec<Arc<ClientConn>> =
            self.all_clients.read().unwrap().values().cloned().collect();
        for client in clients {
            client.stop();
        }

        if let Some(p2p) = &self.p2p {
            p2p.stop();
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(STOP_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("timeout waiting for tunnel tasks to stop; continuing shutdown");
        }

        info!("tunnel stopped");
    }

    pub(crate) fn spawn_task(
        &self,
        future: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(future));
    }

    pub(crate) fn tun_device(&self) -> Option<Arc<dyn TunDevice>> {
        self.tun.read().unwrap().clone()
    }

    // =====================
    // Cipher plumbing
    // =====================

    /// Seal an outgoing frame, honoring the pass-through classifier.
    pub(crate) fn seal_frame(&self, frame: &[u8]) -> CoreResult<Vec<u8>> {
        if self.classifier.should_skip_encryption(frame) {
            return Ok(frame.to_vec());
        }
        Ok(self.ciphers.seal(frame)?)
    }

    /// Open an incoming datagram: active cipher, then the rotation
    /// fallback, then the plaintext pass-through shape.
    pub(crate) fn open_frame(
        &self,
        data: &[u8],
    ) -> CoreResult<(Vec<u8>, Option<(Arc<Cipher>, u64)>)> {
        match self.ciphers.open(data) {
            Ok(result) => Ok(result),
            Err(_) if is_plain_passthrough(data) => Ok((data.to_vec(), None)),
            Err(e) => Err(e.into()),
        }
    }

    /// Rotate the tunnel key and persist it to the config file when one is
    /// known. Persistence failures never abort the rotation.
    pub(crate) fn rotate_cipher(&self, new_key: &str) -> CoreResult<()> {
        self.ciphers.rotate(new_key)?;
        self.config.write().unwrap().key = new_key.to_string();

        if let Some(path) = &self.config_path {
            if let Err(e) = crate::config::update_config_key(path, new_key) {
                warn!("failed to persist rotated key: {}", e);
            } else {
                info!("persisted rotated key to {}", path.display());
            }
        }
        Ok(())
    }

    // =====================
    // Connection management (client mode)
    // =====================

    async fn dial_server(&self) -> CoreResult<Arc<FakeTcpConn>> {
        let (remote_addr, dial_timeout) = {
            let cfg = self.config.read().unwrap();
            (cfg.remote_addr.clone(), Duration::from_secs(cfg.timeout))
        };
        let remote = resolve_remote(&remote_addr).await?;

        info!("connecting to server at {}", remote);
        let conn = FakeTcpConn::dial(remote, dial_timeout).await?;
        Ok(Arc::new(conn))
    }

    pub(crate) async fn current_conn(&self) -> Option<Arc<FakeTcpConn>> {
        self.conn.lock().await.clone()
    }

    async fn drop_connection(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close();
        }
    }

    /// Get the live connection, redialing with capped exponential backoff
    /// if necessary. Only fails once the tunnel is stopping.
    async fn ensure_connected(&self) -> CoreResult<Arc<FakeTcpConn>> {
        if self.shutdown.is_triggered() {
            return Err(CoreError::Stopping);
        }

        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut backoff = 1u64;
        loop {
            if self.shutdown.is_triggered() {
                return Err(CoreError::Stopping);
            }

            info!("attempting to reconnect to server (backoff {}s)", backoff);
            match self.dial_server().await {
                Ok(conn) => {
                    info!(
                        "reconnected to server: {} -> {}",
                        conn.local_addr(),
                        conn.remote_addr()
                    );
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => warn!("reconnect attempt failed: {}", e),
            }

            tokio::select! {
                _ = sleep(Duration::from_secs(backoff)) => {}
                _ = self.shutdown.wait() => return Err(CoreError::Stopping),
            }
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF_SECS);
        }
    }

    /// Tear down the current connection and dial again.
    async fn reconnect(&self) -> CoreResult<Arc<FakeTcpConn>> {
        self.drop_connection().await;
        let conn = self.ensure_connected().await?;
        self.touch_last_recv();
        self.reannounce_p2p_info();
        Ok(conn)
    }

    fn touch_last_recv(&self) {
        *self.last_recv.lock().unwrap() = Instant::now();
    }

    fn idle_duration(&self) -> Duration {
        self.last_recv.lock().unwrap().elapsed()
    }

    fn send_queue_backlog(&self) -> usize {
        self.send_tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    // =====================
    // Client pipelines
    // =====================

    /// TUN reader: virtual interface -> routing decision -> send queue.
    async fn run_tun_reader(self: Arc<Self>) {
        debug!("TUN reader started");

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
                        warn!("TUN read error, stopping tunnel: {}", e);
                        // The interface is gone; wind the tunnel down.
                        self.shutdown.trigger();
                    }
                    break;
                }
            };

            if packet.len() < ipv4::MIN_HEADER_LEN || !ipv4::is_ipv4(&packet) {
                continue;
            }

            let Some(buf) = self.pool.acquire_from(&packet) else {
                continue;
            };

            if self.p2p.is_some() && self.routing.is_some() {
                if let Err(e) = self.send_packet_with_routing(buf).await {
                    debug!("failed to send packet: {}", e);
                }
            } else if let Some(tx) = &self.send_tx {
                if !enqueue_with_timeout(tx, buf, &self.shutdown).await
                    && !self.shutdown.is_triggered()
                {
                    trace!("send queue full, dropping packet");
                }
            }
        }

        debug!("TUN reader stopped");
    }

    /// Pick the best path for one outgoing IPv4 packet: server connection,
    /// or an established direct P2P path, requesting one on demand.
    async fn send_packet_with_routing(&self, buf: PacketBuf) -> CoreResult<()> {
        let Some(dst) = ipv4::destination(&buf) else {
            return Err(CoreError::Fatal("routing a non-IPv4 buffer".into()));
        };

        // Traffic for the server itself never takes a P2P path.
        if self.server_tunnel_ip == Some(dst) {
            return self.queue_to_server(buf).await;
        }

        if let Some(p2p) = &self.p2p {
            if p2p.is_connected(dst) {
                let frame = control_frame(FrameType::Data, &buf);
                let sealed = self.seal_frame(&frame)?;
                match p2p.send_packet(dst, &sealed).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!("P2P send to {} failed, falling back to server: {}", dst, e);
                        self.mark_peer_server_fallback(dst);
                        return self.queue_to_server(buf).await;
                    }
                }
            }

            // No direct path: ask the server to coordinate one, but never
            // hold up the packet.
            if self.should_request_p2p(dst) {
                self.request_p2p_connection(dst).await;
            }
        }

        self.queue_to_server(buf).await
    }

    async fn queue_to_server(&self, buf: PacketBuf) -> CoreResult<()> {
        let Some(tx) = &self.send_tx else {
            return Err(CoreError::Fatal("client send queue missing".into()));
        };
        if enqueue_with_timeout(tx, buf, &self.shutdown).await {
            Ok(())
        } else if self.shutdown.is_triggered() {
            Err(CoreError::Stopping)
        } else {
            Err(CoreError::QueueFull)
        }
    }

    /// Network writer: send queue -> seal -> fake-TCP, reconnecting on
    /// write failure.
    async fn run_net_writer(self: Arc<Self>) {
        debug!("network writer started");
        let mut rx = match self.send_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let mut buf = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(p) => p,
                    None => break,
                },
                _ = self.shutdown.wait() => break,
            };

            // The type byte reuses the buffer's leading headroom.
            if !buf.prepend(FrameType::Data as u8) {
                warn!("packet buffer headroom exhausted, dropping packet");
                continue;
            }

            let sealed = match self.seal_frame(&buf) {
                Ok(s) => s,
                Err(e) => {
                    warn!("encryption error: {}", e);
                    continue;
                }
            };
            drop(buf);

            let conn = match self.ensure_connected().await {
                Ok(c) => c,
                Err(_) => break,
            };

            if let Err(e) = conn.write_packet(&sealed).await {
                if self.shutdown.is_triggered() {
                    break;
                }
                warn!("network write error: {}, reconnecting", e);

                let conn = match self.reconnect().await {
                    Ok(c) => c,
                    Err(_) => break,
                };
                if let Err(e) = conn.write_packet(&sealed).await {
                    // Accept the loss and keep the pipeline alive for the
                    // packets behind it.
                    warn!("network write retry failed, packet lost: {}", e);
                }
            }
        }

        debug!("network writer stopped");
    }

    /// Network reader: fake-TCP -> open -> dispatch. Also owns the idle
    /// timeout that forces a reconnect.
    async fn run_net_reader(self: Arc<Self>) {
        debug!("network reader started");
        self.touch_last_recv();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let idle = self.idle_duration();
            if idle > IDLE_CONNECTION_TIMEOUT {
                let backlog = self.send_queue_backlog();
                if backlog > 0 && idle < IDLE_CONNECTION_TIMEOUT + IDLE_BACKPRESSURE_EXTENSION {
                    // Queued packets get a short grace before the link is
                    // declared dead.
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }

                warn!(
                    "connection idle for {:?} (backlog {} packets), forcing reconnect",
                    idle, backlog
                );
                if self.reconnect().await.is_err() {
                    break;
                }
                continue;
            }

            let conn = match self.ensure_connected().await {
                Ok(c) => c,
                Err(_) => break,
            };

            let packet = match conn.read_packet().await {
                Ok(p) => p,
                Err(NetworkError::Timeout) => continue,
                Err(e) => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    warn!("network read error: {}, reconnecting", e);
                    if self.reconnect().await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if packet.is_empty() {
                continue;
            }
            self.touch_last_recv();

            let (plain, _) = match self.open_frame(&packet) {
                Ok(p) => p,
                Err(e) => {
                    warn!("decryption error ({} byte packet): {}", packet.len(), e);
                    continue;
                }
            };
            if plain.is_empty() {
                continue;
            }

            let Ok(frame_type) = FrameType::try_from(plain[0]) else {
                trace!("unknown frame type 0x{:02x}", plain[0]);
                continue;
            };
            self.dispatch_client_frame(frame_type, &plain[1..]).await;
        }

        debug!("network reader stopped");
    }

    async fn dispatch_client_frame(&self, frame_type: FrameType, payload: &[u8]) {
        match frame_type {
            FrameType::Data => {
                let Some(buf) = self.pool.acquire_from(payload) else {
                    return;
                };
                if let Some(tx) = &self.recv_tx {
                    if !enqueue_with_timeout(tx, buf, &self.shutdown).await
                        && !self.shutdown.is_triggered()
                    {
                        trace!("receive queue full, dropping packet");
                    }
                }
            }
            FrameType::Keepalive => {
                // Liveness only; last_recv is already refreshed.
            }
            FrameType::PublicAddr => self.handle_public_addr(payload),
            FrameType::PeerInfo => self.handle_peer_info_from_server(payload),
            FrameType::Punch => self.handle_punch_from_server(payload),
            FrameType::RouteInfo => {
                let routes = parse_route_list(&String::from_utf8_lossy(payload));
                self.apply_peer_routes(&routes).await;
            }
            FrameType::ConfigUpdate => self.handle_config_update(payload).await,
            FrameType::P2pRequest => {
                trace!("ignoring P2P request frame on client side");
            }
        }
    }

    /// TUN writer: receive queue -> virtual interface, with bounded
    /// ENOBUFS retries.
    async fn run_tun_writer(self: Arc<Self>) {
        debug!("TUN writer started");
        let mut rx = match self.recv_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let buf = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(p) => p,
                    None => break,
                },
                _ = self.shutdown.wait() => break,
            };

            match self.write_tun(&buf).await {
                Ok(()) => {}
                Err(CoreError::Network(NetworkError::NoBufferSpace)) => {
                    trace!("TUN write buffer full after retries, dropping packet");
                }
                Err(_) if self.shutdown.is_triggered() => break,
                Err(e) => {
                    warn!("TUN write error: {}", e);
                    break;
                }
            }
        }

        debug!("TUN writer stopped");
    }

    /// Write one IPv4 packet to the interface, retrying transient buffer
    /// exhaustion with exponential backoff from one millisecond.
    pub(crate) async fn write_tun(&self, packet: &[u8]) -> CoreResult<()> {
        let Some(tun) = self.tun_device() else {
            return Err(CoreError::InterfaceUnavailable("device closed".into()));
        };

        let mut delay = Duration::from_millis(1);
        for attempt in 0..TUN_WRITE_RETRIES {
            match tun.write(packet).await {
                Ok(()) => return Ok(()),
                Err(NetworkError::NoBufferSpace) => {
                    if attempt + 1 < TUN_WRITE_RETRIES {
                        sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Err(NetworkError::NoBufferSpace.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(NetworkError::NoBufferSpace.into())
    }

    /// Tunnel-level keepalive: one Keepalive frame per interval.
    async fn run_keepalive(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.read().unwrap().keepalive_interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => break,
            }

            let frame = [FrameType::Keepalive as u8];
            let sealed = match self.seal_frame(&frame) {
                Ok(s) => s,
                Err(e) => {
                    warn!("keepalive encryption error: {}", e);
                    continue;
                }
            };

            let conn = match self.ensure_connected().await {
                Ok(c) => c,
                Err(_) => break,
            };

            if let Err(e) = conn.write_packet(&sealed).await {
                if self.shutdown.is_triggered() {
                    break;
                }
                warn!("keepalive error: {}, reconnecting", e);
                if self.reconnect().await.is_err() {
                    break;
                }
            }
        }
    }

    // =====================
    // P2P control plane (client side)
    // =====================

    /// Datagrams arriving over the P2P socket: open and dispatch.
    async fn run_p2p_dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<(Ipv4Addr, Vec<u8>)>) {
        loop {
            let (peer_ip, data) = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(p) => p,
                    None => break,
                },
                _ = self.shutdown.wait() => break,
            };

            let (plain, _) = match self.open_frame(&data) {
                Ok(p) => p,
                Err(e) => {
                    warn!("P2P decryption error from {}: {}", peer_ip, e);
                    continue;
                }
            };
            if plain.is_empty() {
                continue;
            }

            let Ok(frame_type) = FrameType::try_from(plain[0]) else {
                continue;
            };
            let payload = &plain[1..];

            match frame_type {
                FrameType::Data => {
                    if let Some(routing) = &self.routing {
                        routing.update_peer(peer_ip, |_| {});
                    }
                    let Some(buf) = self.pool.acquire_from(payload) else {
                        continue;
                    };
                    if let Some(tx) = &self.recv_tx {
                        if !enqueue_with_timeout(tx, buf, &self.shutdown).await
                            && !self.shutdown.is_triggered()
                        {
                            trace!("receive queue full, dropping P2P packet from {}", peer_ip);
                        }
                    }
                }
                FrameType::PeerInfo => self.handle_peer_info_from_server(payload),
                FrameType::RouteInfo => {
                    let routes = parse_route_list(&String::from_utf8_lossy(payload));
                    self.apply_peer_routes(&routes).await;
                }
                _ => {}
            }
        }
    }

    fn handle_public_addr(&self, payload: &[u8]) {
        let addr = String::from_utf8_lossy(payload).to_string();
        info!("received public address from server: {}", addr);
        *self.public_addr.write().unwrap() = Some(addr);

        let Some(p2p) = self.p2p.clone() else { return };
        let detect = self.config.read().unwrap().enable_nat_detection;
        let Some(tunnel) = self.upgrade_self() else { return };

        self.spawn_task(async move {
            if detect {
                let nat = p2p.detect_nat().await;
                info!("NAT detection complete: {}", nat);
            } else {
                // Let the connection settle before announcing.
                sleep(Duration::from_secs(1)).await;
            }
            tunnel.announce_peer_info_with_retry().await;
        });
    }

    /// Announce our P2P endpoints to the server, retrying with exponential
    /// backoff capped at 32 seconds.
    async fn announce_peer_info_with_retry(&self) {
        for attempt in 0..P2P_REANNOUNCE_RETRIES {
            match self.announce_peer_info().await {
                Ok(()) => {
                    info!("announced P2P info to server");
                    return;
                }
                Err(e) => {
                    debug!(
                        "peer info announcement failed (attempt {}/{}): {}",
                        attempt + 1,
                        P2P_REANNOUNCE_RETRIES,
                        e
                    );
                }
            }

            let backoff = (1u64 << (attempt + 1)).min(MAX_RECONNECT_BACKOFF_SECS);
            tokio::select! {
                _ = sleep(Duration::from_secs(backoff)) => {}
                _ = self.shutdown.wait() => return,
            }
        }
        warn!("giving up announcing P2P info after {} attempts", P2P_REANNOUNCE_RETRIES);
    }

    async fn announce_peer_info(&self) -> CoreResult<()> {
        let Some(p2p) = &self.p2p else {
            return Ok(());
        };

        let conn = self
            .current_conn()
            .await
            .ok_or(CoreError::Stopping)?;

        let public = self
            .public_addr
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| CoreError::ConfigInvalid("public address not yet known".into()))?;
        let public_host = public
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .ok_or_else(|| CoreError::ConfigInvalid(format!("bad public address: {}", public)))?;

        let local_host = match conn.local_addr() {
            std::net::SocketAddr::V4(v4) => v4.ip().to_string(),
            other => other.ip().to_string(),
        };

        let p2p_port = p2p.local_port();
        let announcement = PeerAnnouncement {
            tunnel_ip: self.my_tunnel_ip,
            public_addr: format!("{}:{}", public_host, p2p_port),
            local_addr: format!("{}:{}", local_host, p2p_port),
            nat_type: p2p.nat_type(),
        };

        let frame = control_frame(FrameType::PeerInfo, announcement.encode().as_bytes());
        let sealed = self.seal_frame(&frame)?;
        conn.write_packet(&sealed).await?;

        debug!(
            "peer info sent: {} public={} local={} nat={}",
            announcement.tunnel_ip,
            announcement.public_addr,
            announcement.local_addr,
            announcement.nat_type
        );
        Ok(())
    }

    /// After a reconnect the server has a new view of us; wait for the new
    /// PublicAddr and re-announce.
    fn reannounce_p2p_info(&self) {
        if self.p2p.is_none() {
            return;
        }

        // Re-enter through the Arc the tasks hold.
        let Some(tunnel) = self.upgrade_self() else {
            return;
        };
        self.spawn_task(async move {
            tokio::select! {
                _ = sleep(P2P_RECONNECT_ANNOUNCE_DELAY) => {}
                _ = tunnel.shutdown.wait() => return,
            }
            tunnel.announce_peer_info_with_retry().await;
        });
    }

    fn handle_peer_info_from_server(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let Some(message) = PeerInfoMessage::parse(&text) else {
            return;
        };

        match message {
            PeerInfoMessage::Disconnect(peer_ip) => {
                info!("peer {} disconnected, dropping routes", peer_ip);
                if let Some(routing) = &self.routing {
                    routing.remove_peer(peer_ip);
                }
                if let Some(p2p) = &self.p2p {
                    p2p.remove_peer(peer_ip);
                }
            }
            PeerInfoMessage::Announce(announcement) => {
                self.register_peer_announcement(&announcement);

                let Some(p2p) = self.p2p.clone() else { return };
                if !p2p_feasible(p2p.nat_type(), announcement.nat_type) {
                    info!(
                        "P2P with {} infeasible (both symmetric), staying on server relay",
                        announcement.tunnel_ip
                    );
                    return;
                }

                let initiate = should_initiate_punch(
                    p2p.nat_type(),
                    p2p.local_port(),
                    self.my_tunnel_ip,
                    announcement.nat_type,
                    announcement.p2p_port(),
                    announcement.tunnel_ip,
                );

                if initiate {
                    debug!("will initiate P2P connection to {}", announcement.tunnel_ip);
                    let Some(tunnel) = self.upgrade_self() else {
                        return;
                    };
                    let peer_ip = announcement.tunnel_ip;
                    self.spawn_task(async move {
                        sleep(P2P_REGISTRATION_DELAY).await;
                        let _ = p2p.connect_to_peer(peer_ip).await;
                        tunnel.refresh_peer_route(peer_ip, "peer advertisement").await;
                    });
                } else {
                    debug!("waiting for {} to initiate P2P", announcement.tunnel_ip);
                }
            }
        }
    }

    fn handle_punch_from_server(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let Some(PeerInfoMessage::Announce(announcement)) = PeerInfoMessage::parse(&text) else {
            return;
        };
        if announcement.tunnel_ip == self.my_tunnel_ip {
            return;
        }

        self.register_peer_announcement(&announcement);

        let Some(p2p) = self.p2p.clone() else { return };
        if !p2p_feasible(p2p.nat_type(), announcement.nat_type) {
            info!(
                "punch for {} ignored: P2P infeasible (both symmetric)",
                announcement.tunnel_ip
            );
            return;
        }

        info!(
            "punch command for {} at {} (local {})",
            announcement.tunnel_ip, announcement.public_addr, announcement.local_addr
        );

        // Punches are simultaneous by design: start immediately.
        let Some(tunnel) = self.upgrade_self() else {
            return;
        };
        let peer_ip = announcement.tunnel_ip;
        self.spawn_task(async move {
            let _ = p2p.connect_to_peer(peer_ip).await;
            tunnel.refresh_peer_route(peer_ip, "punch").await;
        });
    }

    fn register_peer_announcement(&self, announcement: &PeerAnnouncement) {
        if announcement.tunnel_ip == self.my_tunnel_ip {
            return;
        }

        if let Some(routing) = &self.routing {
            let known = routing.update_peer(announcement.tunnel_ip, |peer| {
                peer.public_addr = announcement.public_addr.clone();
                peer.local_addr = announcement.local_addr.clone();
                peer.nat_type = announcement.nat_type;
            });
            if !known {
                let mut peer = Peer::new(announcement.tunnel_ip);
                peer.public_addr = announcement.public_addr.clone();
                peer.local_addr = announcement.local_addr.clone();
                peer.nat_type = announcement.nat_type;
                routing.add_peer(peer);
            }
        }

        if let Some(p2p) = &self.p2p {
            p2p.add_peer(PeerEndpoint {
                tunnel_ip: announcement.tunnel_ip,
                public_addr: announcement.public_addr.parse().ok(),
                local_addr: announcement.local_addr.parse().ok(),
                nat_type: announcement.nat_type,
            });
        }
    }

    /// Re-evaluate one peer's route after a hole punch settles.
    async fn refresh_peer_route(&self, peer_ip: Ipv4Addr, source: &str) {
        tokio::select! {
            _ = sleep(P2P_HANDSHAKE_WAIT) => {}
            _ = self.shutdown.wait() => return,
        }

        let connected = self
            .p2p
            .as_ref()
            .map(|p| p.is_connected(peer_ip))
            .unwrap_or(false);

        if let Some(routing) = &self.routing {
            routing.update_peer(peer_ip, |peer| {
                peer.connected = connected;
                peer.through_server = !connected;
            });
            routing.update_routes();
        }

        if connected {
            info!("direct route to {} established ({})", peer_ip, source);
        } else {
            info!("P2P to {} not established ({}), using server relay", peer_ip, source);
        }
    }

    fn mark_peer_server_fallback(&self, peer_ip: Ipv4Addr) {
        if let Some(p2p) = &self.p2p {
            p2p.mark_disconnected(peer_ip);
        }
        if let Some(routing) = &self.routing {
            routing.update_peer(peer_ip, |peer| {
                peer.connected = false;
                peer.through_server = true;
            });
            routing.update_routes();
        }
    }

    /// Rate-limited check before sending a P2P request for a destination.
    fn should_request_p2p(&self, dst: Ipv4Addr) -> bool {
        if dst.is_unspecified() || dst.is_multicast() || dst.is_loopback() || dst.is_broadcast() {
            return false;
        }
        if dst.is_link_local() {
            return false;
        }

        let mut pending = self.pending_p2p.lock().unwrap();
        if let Some(last) = pending.get(&dst) {
            if last.elapsed() < P2P_REQUEST_INTERVAL {
                return false;
            }
        }
        pending.insert(dst, Instant::now());
        true
    }

    async fn request_p2p_connection(&self, dst: Ipv4Addr) {
        let frame = control_frame(FrameType::P2pRequest, dst.to_string().as_bytes());
        let sealed = match self.seal_frame(&frame) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to encrypt P2P request: {}", e);
                return;
            }
        };

        if let Some(conn) = self.current_conn().await {
            match conn.write_packet(&sealed).await {
                Ok(()) => debug!("requested P2P connection to {}", dst),
                Err(e) => debug!("failed to send P2P request: {}", e),
            }
        }
    }

    // =====================
    // Route advertisement and maintenance
    // =====================

    /// Unique CIDRs this node announces: configured routes plus its own
    /// tunnel address.
    pub(crate) fn advertised_routes(&self) -> Vec<String> {
        let cfg = self.config.read().unwrap();
        let mut routes: Vec<String> = cfg
            .routes
            .iter()
            .filter(|r| !r.is_empty())
            .cloned()
            .collect();
        if !cfg.tunnel_addr.is_empty() {
            routes.push(cfg.tunnel_addr.clone());
        }
        routes.sort();
        routes.dedup();
        routes
    }

    async fn run_route_advert_loop(self: Arc<Self>) {
        self.send_routes_to_server().await;

        let interval = Duration::from_secs(self.config.read().unwrap().route_advert_interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick already handled

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => break,
            }
            self.send_routes_to_server().await;
        }
    }

    async fn send_routes_to_server(&self) {
        let routes = self.advertised_routes();
        if routes.is_empty() {
            return;
        }

        let payload = encode_route_list(&routes);
        let frame = control_frame(FrameType::RouteInfo, payload.as_bytes());
        let sealed = match self.seal_frame(&frame) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to encrypt route advertisement: {}", e);
                return;
            }
        };

        let conn = match self.ensure_connected().await {
            Ok(c) => c,
            Err(_) => return,
        };
        if let Err(e) = conn.write_packet(&sealed).await {
            warn!("failed to advertise routes: {}", e);
        }
    }

    /// Install routes advertised by the remote side. Install failures are
    /// logged and skipped.
    pub(crate) async fn apply_peer_routes(&self, routes: &[String]) {
        let tun_name = self.tun_name.read().unwrap().clone();
        for route in routes {
            match crate::netcfg::add_route(&tun_name, route).await {
                Ok(()) => info!("applied peer route {} via {}", route, tun_name),
                Err(e) => warn!("failed to apply route {}: {}", route, e),
            }
        }
    }

    async fn run_route_update_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.read().unwrap().route_update_interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => break,
            }

            let Some(routing) = &self.routing else { break };
            routing.update_routes();
            routing.clean_stale_routes(stealthtun_network::routing::STALE_ROUTE_TIMEOUT);

            let stats = routing.get_route_stats();
            debug!(
                "routing stats: {} peers, {} direct, {} relay, {} server",
                stats.total_peers, stats.direct_routes, stats.relay_routes, stats.server_routes
            );
        }
    }

    async fn handle_config_update(&self, payload: &[u8]) {
        let message: ConfigUpdateMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed config update: {}", e);
                return;
            }
        };

        if message.key.is_empty() {
            debug!("config update without key, ignoring");
            return;
        }

        if let Some(routes) = &message.routes {
            if !routes.is_empty() {
                self.config.write().unwrap().routes = routes.clone();
                self.apply_peer_routes(routes).await;
            }
        }

        info!("applying server-pushed key rotation");
        if let Err(e) = self.rotate_cipher(&message.key) {
            warn!("failed to apply rotated key: {}", e);
        }
    }

    /// The engine tasks hold `Arc<Tunnel>`; plain `&self` paths that need
    /// to spawn re-enter through this back-reference.
    pub(crate) fn upgrade_self(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }
}

/// Resolve `host:port` to an IPv4 socket address.
async fn resolve_remote(remote_addr: &str) -> CoreResult<SocketAddrV4> {
    let addrs = tokio::net::lookup_host(remote_addr)
        .await
        .map_err(|e| CoreError::ConfigInvalid(format!("cannot resolve {}: {}", remote_addr, e)))?;

    addrs
        .into_iter()
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(v4),
            _ => None,
        })
        .ok_or_else(|| {
            CoreError::ConfigInvalid(format!("no IPv4 address for {}", remote_addr))
        })
}

/// Decide which side starts a simultaneous hole punch.
///
/// The side with the harder NAT initiates; ties break toward the lower P2P
/// port, then the lower last tunnel-IP octet. Unknown NAT types always
/// initiate.
pub(crate) fn should_initiate_punch(
    my_nat: NatType,
    my_port: u16,
    my_ip: Ipv4Addr,
    peer_nat: NatType,
    peer_port: Option<u16>,
    peer_ip: Ipv4Addr,
) -> bool {
    if my_nat == NatType::Unknown || peer_nat == NatType::Unknown {
        return true;
    }
    if my_nat.level() != peer_nat.level() {
        return my_nat.level() > peer_nat.level();
    }
    match peer_port {
        Some(peer_port) if peer_port != my_port => my_port < peer_port,
        _ => my_ip.octets()[3] < peer_ip.octets()[3],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_harder_nat_initiates() {
        // Symmetric (level 5) vs full cone (level 2): symmetric initiates.
        assert!(should_initiate_punch(
            NatType::Symmetric,
            4000,
            ip("10.0.0.2"),
            NatType::FullCone,
            Some(5000),
            ip("10.0.0.3"),
        ));
        assert!(!should_initiate_punch(
            NatType::FullCone,
            4000,
            ip("10.0.0.2"),
            NatType::Symmetric,
            Some(5000),
            ip("10.0.0.3"),
        ));
    }

    #[test]
    fn test_port_tiebreak() {
        // Equal NAT levels: lower port initiates.
        assert!(should_initiate_punch(
            NatType::PortRestrictedCone,
            4000,
            ip("10.0.0.2"),
            NatType::PortRestrictedCone,
            Some(5000),
            ip("10.0.0.3"),
        ));
        assert!(!should_initiate_punch(
            NatType::PortRestrictedCone,
            5000,
            ip("10.0.0.2"),
            NatType::PortRestrictedCone,
            Some(4000),
            ip("10.0.0.3"),
        ));
    }

    #[test]
    fn test_last_octet_tiebreak() {
        // Equal NAT and ports: lower last octet initiates.
        assert!(should_initiate_punch(
            NatType::RestrictedCone,
            4000,
            ip("10.0.0.2"),
            NatType::RestrictedCone,
            Some(4000),
            ip("10.0.0.3"),
        ));
        assert!(!should_initiate_punch(
            NatType::RestrictedCone,
            4000,
            ip("10.0.0.9"),
            NatType::RestrictedCone,
            Some(4000),
            ip("10.0.0.3"),
        ));
    }

    #[test]
    fn test_unknown_nat_always_initiates() {
        assert!(should_initiate_punch(
            NatType::Unknown,
            4000,
            ip("10.0.0.2"),
            NatType::Symmetric,
            Some(5000),
            ip("10.0.0.3"),
        ));
    }
}

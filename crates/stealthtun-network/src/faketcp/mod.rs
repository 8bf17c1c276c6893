//! Fake-TCP Transport
//!
//! A connection abstraction whose wire bytes pass middlebox inspection as
//! TCP while the entire state machine lives in this process. Provides:
//! - `FakeTcpConn::dial` / `FakeTcpListener::bind` + `accept`
//! - datagram-style `write_packet` / `read_packet` with 1400-byte
//!   segmentation and size-based reassembly (no retransmission)
//! - transport-level keepalives that keep NAT mappings fresh

mod raw;
pub mod wire;

pub use raw::{check_raw_socket_support, local_ip_for, RawSocket};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use wire::{flags, parse_frame, TcpFrame};

/// Segmentation unit: payloads larger than this are split across frames
pub const SEG_SIZE: usize = 1400;

/// Transport keepalive cadence
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Idle threshold after which the upper layer may evict a connection
pub const STALE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Padding length of a transport keepalive frame
const KEEPALIVE_PADDING: usize = 20;

/// Handshake attempts before giving up
const HANDSHAKE_RETRIES: usize = 3;

/// Delay between handshake attempts
const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Per-connection receive queue depth (raw frames)
const RECV_QUEUE_SIZE: usize = 4096;

/// Pending-accept queue depth
const ACCEPT_QUEUE_SIZE: usize = 64;

/// Default read deadline applied by `read_packet`
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

type TupleKey = (Ipv4Addr, u16);

/// Demux table shared between a listener and its accepted connections
struct DemuxTable {
    tuples: RwLock<HashMap<TupleKey, mpsc::Sender<TcpFrame>>>,
}

struct ConnShared {
    raw: Arc<RawSocket>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    seq: AtomicU32,
    ack: AtomicU32,
    isn: u32,
    connected: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
    last_activity: StdMutex<Instant>,
    read_timeout: StdMutex<Duration>,
    /// Set on accepted connections so close() deregisters the tuple
    demux: Option<(Arc<DemuxTable>, TupleKey)>,
}

impl ConnShared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    async fn send_frame(&self, tcp_flags: u8, payload: &[u8]) -> NetworkResult<()> {
        let frame = wire::build_frame(
            self.local,
            self.remote,
            self.seq.load(Ordering::SeqCst),
            self.ack.load(Ordering::SeqCst),
            tcp_flags,
            &[],
            payload,
        );
        self.raw.send_to(&frame, *self.remote.ip()).await?;
        Ok(())
    }

    async fn send_syn_ack(&self) -> NetworkResult<()> {
        let frame = wire::build_frame(
            self.local,
            self.remote,
            self.isn,
            self.ack.load(Ordering::SeqCst),
            flags::SYN | flags::ACK,
            &[],
            &[],
        );
        self.raw.send_to(&frame, *self.remote.ip()).await?;
        Ok(())
    }

    fn mark_closed(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        if was_open {
            self.shutdown.notify_waiters();
            if let Some((demux, key)) = &self.demux {
                demux.tuples.write().unwrap().remove(key);
            }
        }
        was_open
    }
}

/// One fake-TCP connection
pub struct FakeTcpConn {
    shared: Arc<ConnShared>,
    incoming: AsyncMutex<mpsc::Receiver<TcpFrame>>,
}

impl FakeTcpConn {
    /// Connect to a remote fake-TCP endpoint.
    ///
    /// Runs the SYN / SYN|ACK / ACK handshake with up to three retries and
    /// starts the connection's receive and keepalive tasks.
    pub async fn dial(remote: SocketAddrV4, handshake_timeout: Duration) -> NetworkResult<Self> {
        let raw = Arc::new(RawSocket::new()?);
        let local_ip = local_ip_for(*remote.ip())?;
        let local_port: u16 = rand::thread_rng().gen_range(1024..65535);
        let local = SocketAddrV4::new(local_ip, local_port);

        let isn: u32 = rand::random();
        let (frame_tx, frame_rx) = mpsc::channel(RECV_QUEUE_SIZE);

        let shared = Arc::new(ConnShared {
            raw: raw.clone(),
            local,
            remote,
            seq: AtomicU32::new(isn),
            ack: AtomicU32::new(0),
            isn,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_activity: StdMutex::new(Instant::now()),
            read_timeout: StdMutex::new(DEFAULT_READ_TIMEOUT),
            demux: None,
        });

        // Dedicated receive loop: this connection owns its raw socket.
        tokio::spawn(dial_recv_loop(shared.clone(), frame_tx));

        let conn = Self {
            shared,
            incoming: AsyncMutex::new(frame_rx),
        };
        conn.handshake_as_client(handshake_timeout).await?;
        conn.spawn_keepalive();

        info!("fake-TCP connection established: {} -> {}", local, remote);
        Ok(conn)
    }

    async fn handshake_as_client(&self, handshake_timeout: Duration) -> NetworkResult<()> {
        let per_attempt = handshake_timeout / HANDSHAKE_RETRIES as u32;
        let shared = &self.shared;
        let mut incoming = self.incoming.lock().await;

        for attempt in 0..HANDSHAKE_RETRIES {
            if attempt > 0 {
                sleep(HANDSHAKE_RETRY_DELAY).await;
            }

            debug!(
                "handshake attempt {}/{} to {}",
                attempt + 1,
                HANDSHAKE_RETRIES,
                shared.remote
            );
            let syn = wire::build_frame(
                shared.local,
                shared.remote,
                shared.isn,
                0,
                flags::SYN,
                &[],
                &[],
            );
            shared.raw.send_to(&syn, *shared.remote.ip()).await?;

            let deadline = Instant::now() + per_attempt;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                let frame = match timeout(remaining, incoming.recv()).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Err(NetworkError::ConnClosed),
                    Err(_) => break,
                };

                if frame.flags & (flags::SYN | flags::ACK) != flags::SYN | flags::ACK {
                    continue;
                }
                if frame.ack != shared.isn.wrapping_add(1) {
                    trace!("SYN|ACK with unexpected ack {}", frame.ack);
                    continue;
                }

                shared.seq.store(shared.isn.wrapping_add(1), Ordering::SeqCst);
                shared
                    .ack
                    .store(frame.seq.wrapping_add(1), Ordering::SeqCst);
                shared.send_frame(flags::ACK, &[]).await?;
                shared.connected.store(true, Ordering::SeqCst);
                shared.touch();

                // Drop any handshake-phase duplicates still queued.
                while incoming.try_recv().is_ok() {}
                return Ok(());
            }
        }

        Err(NetworkError::HandshakeTimeout(HANDSHAKE_RETRIES))
    }

    fn from_accept(shared: Arc<ConnShared>, incoming: mpsc::Receiver<TcpFrame>) -> Self {
        Self {
            shared,
            incoming: AsyncMutex::new(incoming),
        }
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.shared.local)
    }

    /// Remote socket address
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.shared.remote)
    }

    /// Time since the last inbound frame
    pub fn idle_time(&self) -> Duration {
        self.shared.last_activity.lock().unwrap().elapsed()
    }

    /// Adjust the deadline used by `read_packet`
    pub fn set_read_timeout(&self, deadline: Duration) {
        *self.shared.read_timeout.lock().unwrap() = deadline;
    }

    /// Segment and emit one application datagram.
    pub async fn write_packet(&self, payload: &[u8]) -> NetworkResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnClosed);
        }

        for chunk in payload.chunks(SEG_SIZE) {
            self.shared.send_frame(flags::ACK, chunk).await?;
            self.shared
                .seq
                .fetch_add(chunk.len() as u32, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Return the next reassembled datagram.
    ///
    /// Applies the configured read deadline (`Timeout`), and fails with
    /// `ConnClosed` once the connection is closed. Frames of exactly
    /// [`SEG_SIZE`] bytes extend the datagram; the first shorter frame
    /// terminates it. Lost segments simply truncate the datagram, which the
    /// encrypted layer above rejects as packet loss.
    pub async fn read_packet(&self) -> NetworkResult<Vec<u8>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnClosed);
        }

        let deadline = *self.shared.read_timeout.lock().unwrap();
        let mut incoming = self.incoming.lock().await;

        let first = self.next_payload(&mut incoming, deadline).await?;
        if first.len() < SEG_SIZE {
            return Ok(first);
        }

        // Reassemble a segmented datagram.
        let mut assembled = first;
        loop {
            match self.next_payload(&mut incoming, deadline).await {
                Ok(segment) => {
                    let done = segment.len() < SEG_SIZE;
                    assembled.extend_from_slice(&segment);
                    if done {
                        return Ok(assembled);
                    }
                }
                // A missing tail segment truncates the datagram.
                Err(NetworkError::Timeout) => return Ok(assembled),
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_payload(
        &self,
        incoming: &mut mpsc::Receiver<TcpFrame>,
        deadline: Duration,
    ) -> NetworkResult<Vec<u8>> {
        loop {
            let recv = async {
                tokio::select! {
                    frame = incoming.recv() => frame.ok_or(NetworkError::ConnClosed),
                    _ = self.shared.shutdown.notified() => Err(NetworkError::ConnClosed),
                }
            };

            let frame = match timeout(deadline, recv).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if self.shared.closed.load(Ordering::SeqCst) {
                        return Err(NetworkError::ConnClosed);
                    }
                    return Err(NetworkError::Timeout);
                }
            };

            self.shared.touch();

            // Handshake retransmits can still arrive after establishment.
            if frame.flags & flags::SYN != 0 {
                continue;
            }
            if frame.flags & flags::RST != 0 {
                info!("connection {} reset by peer", self.shared.remote);
                return Err(NetworkError::ConnClosed);
            }
            if frame.payload.is_empty() {
                continue;
            }

            self.shared.ack.store(
                frame.seq.wrapping_add(frame.payload.len() as u32),
                Ordering::SeqCst,
            );
            return Ok(frame.payload);
        }
    }

    /// Close the connection. Idempotent; unblocks in-flight reads.
    pub fn close(&self) {
        if self.shared.mark_closed() {
            debug!("fake-TCP connection to {} closed", self.shared.remote);
        }
    }

    fn spawn_keepalive(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let padding = [0u8; KEEPALIVE_PADDING];
            loop {
                tokio::select! {
                    _ = sleep(KEEPALIVE_INTERVAL) => {}
                    _ = shared.shutdown.notified() => return,
                }
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                if shared.connected.load(Ordering::SeqCst) {
                    if let Err(e) = shared.send_frame(flags::ACK, &padding).await {
                        debug!("transport keepalive failed: {}", e);
                    }
                }
            }
        });
    }
}

impl Drop for FakeTcpConn {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

/// Receive loop for dialed connections (dedicated raw socket).
async fn dial_recv_loop(shared: Arc<ConnShared>, frame_tx: mpsc::Sender<TcpFrame>) {
    let mut buf = vec![0u8; 65535];
    loop {
        let n = tokio::select! {
            res = shared.raw.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    if !shared.closed.load(Ordering::SeqCst) {
                        warn!("raw socket receive error: {}", e);
                    }
                    return;
                }
            },
            _ = shared.shutdown.notified() => return,
        };

        let Some(frame) = parse_frame(&buf[..n]) else {
            continue;
        };
        // Only frames for this tuple are interesting; everything else on the
        // raw socket belongs to the kernel or other connections.
        if frame.dst.port() != shared.local.port() {
            continue;
        }
        if frame.src.ip() != shared.remote.ip() || frame.src.port() != shared.remote.port() {
            continue;
        }

        if frame_tx.send(frame).await.is_err() {
            return;
        }
    }
}

struct ListenerShared {
    raw: Arc<RawSocket>,
    local: SocketAddrV4,
    demux: Arc<DemuxTable>,
    closed: AtomicBool,
    shutdown: Notify,
}

/// Fake-TCP listener: demultiplexes inbound frames by `(srcIP, srcPort)`
/// and produces a connection per completed handshake.
pub struct FakeTcpListener {
    shared: Arc<ListenerShared>,
    ready: AsyncMutex<mpsc::Receiver<FakeTcpConn>>,
}

impl FakeTcpListener {
    /// Bind the raw socket and start the demux loop.
    pub fn bind(local: SocketAddrV4) -> NetworkResult<Self> {
        let raw = Arc::new(RawSocket::new()?);

        let shared = Arc::new(ListenerShared {
            raw,
            local,
            demux: Arc::new(DemuxTable {
                tuples: RwLock::new(HashMap::new()),
            }),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let (ready_tx, ready_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        tokio::spawn(listener_loop(shared.clone(), ready_tx));

        info!("fake-TCP listener bound on {}", local);
        Ok(Self {
            shared,
            ready: AsyncMutex::new(ready_rx),
        })
    }

    /// Local bound address
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.shared.local)
    }

    /// Wait for the next fully established connection.
    pub async fn accept(&self) -> NetworkResult<FakeTcpConn> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ListenerClosed);
        }

        let mut ready = self.ready.lock().await;
        tokio::select! {
            conn = ready.recv() => conn.ok_or(NetworkError::ListenerClosed),
            _ = self.shared.shutdown.notified() => Err(NetworkError::ListenerClosed),
        }
    }

    /// Close the listener. Idempotent; unblocks in-flight `accept` calls.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.shutdown.notify_waiters();
            debug!("fake-TCP listener on {} closed", self.shared.local);
        }
    }
}

impl Drop for FakeTcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listener demux loop: routes frames to live connections and turns fresh
/// SYNs into pending handshakes.
async fn listener_loop(shared: Arc<ListenerShared>, ready_tx: mpsc::Sender<FakeTcpConn>) {
    let mut buf = vec![0u8; 65535];

    loop {
        let n = tokio::select! {
            res = shared.raw.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    if !shared.closed.load(Ordering::SeqCst) {
                        warn!("listener raw socket error: {}", e);
                    }
                    return;
                }
            },
            _ = shared.shutdown.notified() => return,
        };

        // Drop rules: short frames, non-TCP and wrong-port frames never
        // reach a connection.
        let Some(frame) = parse_frame(&buf[..n]) else {
            continue;
        };
        if frame.dst.port() != shared.local.port() {
            continue;
        }

        let key: TupleKey = (*frame.src.ip(), frame.src.port());
        let existing = {
            let tuples = shared.demux.tuples.read().unwrap();
            tuples.get(&key).cloned()
        };

        if let Some(tx) = existing {
            if tx.send(frame).await.is_err() {
                shared.demux.tuples.write().unwrap().remove(&key);
            }
            continue;
        }

        if frame.flags == flags::SYN {
            spawn_accept_handshake(&shared, frame, key, ready_tx.clone());
        } else {
            trace!("ignoring non-SYN frame from unknown tuple {:?}", key);
        }
    }
}

/// Create the per-connection record for a fresh SYN and drive the server
/// side of the handshake. A SYN retransmit for the same tuple lands in the
/// connection's queue and is answered with another SYN|ACK instead of a new
/// connection.
fn spawn_accept_handshake(
    shared: &Arc<ListenerShared>,
    syn: TcpFrame,
    key: TupleKey,
    ready_tx: mpsc::Sender<FakeTcpConn>,
) {
    let isn: u32 = rand::random();
    let (frame_tx, frame_rx) = mpsc::channel(RECV_QUEUE_SIZE);

    // The listener may be bound to 0.0.0.0; the SYN's destination tells us
    // which local address this client is actually talking to.
    let local = syn.dst;
    let remote = syn.src;

    let conn_shared = Arc::new(ConnShared {
        raw: shared.raw.clone(),
        local,
        remote,
        seq: AtomicU32::new(isn),
        ack: AtomicU32::new(syn.seq.wrapping_add(1)),
        isn,
        connected: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        shutdown: Notify::new(),
        last_activity: StdMutex::new(Instant::now()),
        read_timeout: StdMutex::new(DEFAULT_READ_TIMEOUT),
        demux: Some((shared.demux.clone(), key)),
    });

    shared.demux.tuples.write().unwrap().insert(key, frame_tx);

    let listener = shared.clone();
    tokio::spawn(async move {
        let mut frame_rx = frame_rx;

        for _ in 0..HANDSHAKE_RETRIES * 2 {
            if listener.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = conn_shared.send_syn_ack().await {
                warn!("failed to send SYN|ACK to {}: {}", remote, e);
                break;
            }

            match timeout(HANDSHAKE_RETRY_DELAY * 2, frame_rx.recv()).await {
                Ok(Some(frame)) => {
                    if frame.flags & flags::RST != 0 {
                        break;
                    }
                    if frame.flags == flags::SYN {
                        // Handshake retransmit: answer with SYN|ACK again.
                        continue;
                    }
                    if frame.flags & flags::ACK != 0
                        && frame.ack == conn_shared.isn.wrapping_add(1)
                    {
                        conn_shared
                            .seq
                            .store(conn_shared.isn.wrapping_add(1), Ordering::SeqCst);
                        conn_shared.connected.store(true, Ordering::SeqCst);
                        conn_shared.touch();

                        info!("accepted fake-TCP connection from {}", remote);
                        let conn = FakeTcpConn::from_accept(conn_shared.clone(), frame_rx);
                        conn.spawn_keepalive();
                        if ready_tx.send(conn).await.is_err() {
                            debug!("accept queue closed, dropping connection");
                        }
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => continue, // resend SYN|ACK
            }
        }

        debug!("handshake with {} never completed", remote);
        conn_shared.mark_closed();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw sockets need root, so the interrupt tests follow the same
    // #[ignore] convention as the network-dependent STUN tests.

    #[tokio::test]
    #[ignore] // requires CAP_NET_RAW
    async fn test_listener_close_interrupts_accept() {
        let listener = Arc::new(
            FakeTcpListener::bind("127.0.0.1:19876".parse().unwrap()).unwrap(),
        );

        let accept_task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };

        sleep(Duration::from_millis(500)).await;
        listener.close();

        let result = timeout(Duration::from_secs(3), accept_task)
            .await
            .expect("accept did not return within 3s after close")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // requires CAP_NET_RAW
    async fn test_conn_close_interrupts_read() {
        // Dial somewhere that never answers; handshake fails fast, so build
        // the connection state directly through a listener pair instead.
        let listener = Arc::new(
            FakeTcpListener::bind("127.0.0.1:19877".parse().unwrap()).unwrap(),
        );
        let dial = tokio::spawn(async move {
            FakeTcpConn::dial("127.0.0.1:19877".parse().unwrap(), Duration::from_secs(5)).await
        });
        let server_conn = listener.accept().await.unwrap();
        let client_conn = dial.await.unwrap().unwrap();

        let server_conn = Arc::new(server_conn);
        let read_task = {
            let conn = server_conn.clone();
            tokio::spawn(async move {
                loop {
                    match conn.read_packet().await {
                        Err(NetworkError::Timeout) => continue,
                        other => return other,
                    }
                }
            })
        };

        sleep(Duration::from_millis(500)).await;
        server_conn.close();

        let result = timeout(Duration::from_secs(3), read_task)
            .await
            .expect("read did not return within 3s after close")
            .unwrap();
        assert!(result.is_err());
        drop(client_conn);
    }

    #[test]
    fn test_segment_count() {
        // write_packet emits ceil(len / SEG_SIZE) frames.
        assert_eq!((3500usize).div_ceil(SEG_SIZE), 3);
        assert_eq!((1400usize).div_ceil(SEG_SIZE), 1);
        assert_eq!((1401usize).div_ceil(SEG_SIZE), 2);
    }
}

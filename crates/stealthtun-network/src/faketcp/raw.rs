//! Async raw socket
//!
//! A `SOCK_RAW`/`IPPROTO_TCP` socket wrapped in tokio's `AsyncFd` so the
//! transport can await frames without blocking a thread. The IP header is
//! included on send (`IP_HDRINCL`); the kernel TCP stack never sees these
//! flows as connections.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};

/// Async wrapper over a raw IPv4/TCP socket
pub struct RawSocket {
    io: AsyncFd<Socket>,
}

impl RawSocket {
    /// Create the raw socket. Requires CAP_NET_RAW (typically root).
    pub fn new() -> NetworkResult<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .map_err(|e| NetworkError::RawSocket(format!("socket creation failed: {}", e)))?;

        socket
            .set_header_included(true)
            .map_err(|e| NetworkError::RawSocket(format!("IP_HDRINCL failed: {}", e)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::RawSocket(format!("set_nonblocking failed: {}", e)))?;

        let io = AsyncFd::new(socket)
            .map_err(|e| NetworkError::RawSocket(format!("AsyncFd registration failed: {}", e)))?;

        debug!("raw TCP socket created");
        Ok(Self { io })
    }

    /// Receive one raw frame (IPv4 header included).
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.io.readable().await?;
            let attempt = guard.try_io(|inner| {
                // `Read` is implemented for `&Socket`.
                let mut socket = inner.get_ref();
                socket.read(buf)
            });
            match attempt {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one complete frame to the destination host.
    ///
    /// The port lives inside the TCP header; the socket address only routes
    /// the frame.
    pub async fn send_to(&self, frame: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr: SockAddr = SocketAddrV4::new(dst, 0).into();
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(frame, &addr)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Probe whether raw sockets are usable in this environment.
pub fn check_raw_socket_support() -> NetworkResult<()> {
    match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(NetworkError::RawSocket(
            "raw sockets require root (CAP_NET_RAW)".into(),
        )),
        Err(e) => Err(NetworkError::RawSocket(e.to_string())),
    }
}

/// Pick the local IPv4 address the kernel would use to reach `remote`.
///
/// Done by "connecting" a throwaway UDP socket; no packets are sent.
pub fn local_ip_for(remote: Ipv4Addr) -> NetworkResult<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect(SocketAddrV4::new(remote, 53))?;
    match probe.local_addr()? {
        std::net::SocketAddr::V4(v4) => Ok(*v4.ip()),
        other => Err(NetworkError::RawSocket(format!(
            "unexpected local address family: {}",
            other
        ))),
    }
}

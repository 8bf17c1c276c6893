//! macOS TUN device
//!
//! utun devices frame every packet with a 4-byte protocol family header
//! (AF_INET, big endian). This module strips it on read and prepends it on
//! write so the rest of the system only ever sees raw IPv4.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// AF_INET protocol family header, big endian
const AF_INET_HEADER: [u8; 4] = [0, 0, 0, 2];

/// macOS utun device backed by the `tun` crate
pub struct MacOsTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl MacOsTun {
    /// Create and bring up the device.
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        if !config.name.is_empty() {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32).up();

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::TunError(format!("failed to create utun device: {}", e)))?;

        let name = if config.name.is_empty() {
            "utun".to_string()
        } else {
            config.name.clone()
        };
        info!("created utun device {} (mtu {})", name, config.mtu);

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name,
            mtu: config.mtu,
        })
    }
}

fn map_io_error(e: std::io::Error) -> NetworkError {
    match e.raw_os_error() {
        Some(code) if code == libc::EBADF => NetworkError::TunClosed,
        Some(code) if code == libc::ENOBUFS => NetworkError::NoBufferSpace,
        _ => NetworkError::TunError(e.to_string()),
    }
}

/// Strip the utun protocol family header when present.
fn strip_family_header(buf: &[u8]) -> &[u8] {
    if buf.first() == Some(&0x45) {
        // Already a bare IPv4 header.
        return buf;
    }
    if buf.len() > 4 && (buf[..4] == AF_INET_HEADER || buf[4] >> 4 == 4) {
        return &buf[4..];
    }
    buf
}

#[async_trait]
impl TunDevice for MacOsTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 64];
        let mut device = self.device.lock().await;

        let n = device.read(&mut buf).await.map_err(map_io_error)?;
        let packet = strip_family_header(&buf[..n]).to_vec();
        Ok(Bytes::from(packet))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        let mut framed = Vec::with_capacity(4 + packet.len());
        framed.extend_from_slice(&AF_INET_HEADER);
        framed.extend_from_slice(packet);

        let mut device = self.device.lock().await;
        device.write_all(&framed).await.map_err(map_io_error)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing utun device {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_header_stripping() {
        let mut framed = AF_INET_HEADER.to_vec();
        framed.extend_from_slice(&[0x45, 0, 0, 20]);
        assert_eq!(strip_family_header(&framed), &[0x45, 0, 0, 20]);

        let bare = [0x45u8, 0, 0, 20];
        assert_eq!(strip_family_header(&bare), &bare);
    }
}

//! Linux TUN device

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// Linux TUN device backed by the `tun` crate
pub struct LinuxTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create and bring up the device.
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        if !config.name.is_empty() {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32).up();

        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::TunError(format!("failed to create TUN device: {}", e)))?;

        let name = if config.name.is_empty() {
            "tun0".to_string()
        } else {
            config.name.clone()
        };
        info!("created TUN device {} (mtu {})", name, config.mtu);

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

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 64];
        let mut device = self.device.lock().await;

        let n = device.read(&mut buf).await.map_err(map_io_error)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        let mut device = self.device.lock().await;
        device.write_all(packet).await.map_err(map_io_error)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing TUN device {}", self.name);
        Ok(())
    }
}

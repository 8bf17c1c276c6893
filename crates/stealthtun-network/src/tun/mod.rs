//! Virtual Interface Abstraction
//!
//! Platform-agnostic TUN device trait with Linux and macOS implementations.
//! The contract the engine relies on:
//! - `read` blocks until one IPv4 frame is available, or fails with
//!   [`crate::NetworkError::TunClosed`] once the device is gone
//! - `write` may fail with [`crate::NetworkError::NoBufferSpace`], which the
//!   caller retries with backoff
//! - the macOS 4-byte protocol-family header never leaves this module

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetworkResult;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacOsTun;

/// TUN device configuration
///
/// Addressing is applied afterwards through the OS command surface, the
/// device itself is only created and brought up here.
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Requested device name; empty lets the kernel assign one
    pub name: String,

    /// Maximum transmission unit
    pub mtu: u16,
}

/// Platform-agnostic TUN device
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IPv4 frame.
    async fn read(&self) -> NetworkResult<Bytes>;

    /// Write one IPv4 frame.
    async fn write(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Actual device name
    fn name(&self) -> &str;

    /// Configured MTU
    fn mtu(&self) -> u16;

    /// Release the device
    async fn close(&self) -> NetworkResult<()>;
}

/// Whether a requested interface name is safe to hand to the OS tooling.
///
/// Anything else falls back to a kernel-assigned name.
pub fn is_safe_tun_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    if name.len() > 32 {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Create the platform TUN device.
pub async fn create_tun(config: TunConfig) -> NetworkResult<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        let device = LinuxTun::create(config).await?;
        Ok(Box::new(device))
    }

    #[cfg(target_os = "macos")]
    {
        let device = MacOsTun::create(config).await?;
        Ok(Box::new(device))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = config;
        Err(crate::error::NetworkError::TunError(
            "unsupported platform".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_names() {
        assert!(is_safe_tun_name(""));
        assert!(is_safe_tun_name("tun0"));
        assert!(is_safe_tun_name("stealth_tun-1"));

        assert!(!is_safe_tun_name("tun0; rm -rf /"));
        assert!(!is_safe_tun_name("tun 0"));
        assert!(!is_safe_tun_name(&"x".repeat(33)));
    }
}

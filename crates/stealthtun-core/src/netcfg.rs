//! OS Network Configuration
//!
//! Thin wrappers over `ip` (Linux) and `ifconfig`/`route` (macOS) for
//! interface addressing and route installation. Failures here are reported
//! to the caller but never abort the tunnel.

use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use stealthtun_network::tun::is_safe_tun_name;

async fn run(program: &str, args: &[&str]) -> CoreResult<()> {
    debug!("running: {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(CoreError::RouteInstallFailed(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Assign the tunnel address and MTU to the interface and bring it up.
pub async fn configure_interface(tun_name: &str, tunnel_addr: &str, mtu: usize) -> CoreResult<()> {
    if tun_name.is_empty() || !is_safe_tun_name(tun_name) {
        return Err(CoreError::ConfigInvalid(format!(
            "unsafe interface name: {:?}",
            tun_name
        )));
    }
    let net: Ipv4Net = tunnel_addr
        .parse()
        .map_err(|_| CoreError::ConfigInvalid(format!("invalid tunnel address: {}", tunnel_addr)))?;

    let mtu_str = mtu.to_string();

    if cfg!(target_os = "macos") {
        let addr = net.addr().to_string();
        let mask = net.netmask().to_string();
        run(
            "ifconfig",
            &[tun_name, "inet", &addr, &addr, "netmask", &mask, "up"],
        )
        .await?;
        run("ifconfig", &[tun_name, "mtu", &mtu_str]).await?;
    } else {
        run("ip", &["addr", "add", tunnel_addr, "dev", tun_name]).await?;
        run("ip", &["link", "set", "dev", tun_name, "up"]).await?;
        run("ip", &["link", "set", "dev", tun_name, "mtu", &mtu_str]).await?;
    }

    info!("configured {} with {} (mtu {})", tun_name, tunnel_addr, mtu);
    Ok(())
}

/// Install a route to `cidr` through the tunnel interface.
pub async fn add_route(tun_name: &str, cidr: &str) -> CoreResult<()> {
    if tun_name.is_empty() || !is_safe_tun_name(tun_name) {
        return Err(CoreError::ConfigInvalid("unsafe interface name".into()));
    }
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|_| CoreError::ConfigInvalid(format!("invalid route: {}", cidr)))?;
    let normalized = net.trunc().to_string();

    if cfg!(target_os = "macos") {
        // Clear any stale route for this network first.
        let _ = Command::new("route")
            .args(["delete", "-net", &normalized])
            .output()
            .await;
        run("route", &["add", "-net", &normalized, "-interface", tun_name]).await
    } else {
        run("ip", &["route", "replace", &normalized, "dev", tun_name]).await
    }
}

/// Remove a route previously installed with [`add_route`]. Best effort.
pub async fn delete_route(tun_name: &str, cidr: &str) {
    if tun_name.is_empty() || !is_safe_tun_name(tun_name) {
        return;
    }
    let Ok(net) = cidr.parse::<Ipv4Net>() else {
        return;
    };
    let normalized = net.trunc().to_string();

    let result = if cfg!(target_os = "macos") {
        Command::new("route")
            .args(["delete", "-net", &normalized])
            .output()
            .await
    } else {
        Command::new("ip")
            .args(["route", "del", &normalized, "dev", tun_name])
            .output()
            .await
    };
    if let Err(e) = result {
        debug!("route removal for {} failed: {}", normalized, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsafe_names_rejected() {
        let result = configure_interface("tun0; reboot", "10.0.0.1/24", 1400).await;
        assert!(matches!(result, Err(CoreError::ConfigInvalid(_))));

        let result = add_route("bad name", "10.0.0.0/24").await;
        assert!(matches!(result, Err(CoreError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_invalid_cidr_rejected() {
        let result = add_route("tun0", "not-a-cidr").await;
        assert!(matches!(result, Err(CoreError::ConfigInvalid(_))));
    }
}

//! StealthTun CLI
//!
//! Userspace layer-3 VPN that carries IPv4 over a raw-socket carrier whose
//! wire bytes pass middlebox inspection as TCP, with AES-256-GCM framing,
//! zero-downtime key rotation and on-demand P2P hole punching.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stealthtun_core::{Config, Tunnel};

/// StealthTun - firewall-traversing L3 VPN
#[derive(Parser)]
#[command(name = "stealthtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel
    Run {
        /// Config file path
        #[arg(short, long)]
        config: PathBuf,

        /// Override the encryption passphrase from the config file
        #[arg(short, long)]
        key: Option<String>,

        /// Override the TUN device name
        #[arg(long)]
        tun_name: Option<String>,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Config file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run {
            config,
            key,
            tun_name,
        } => cmd_run(config, key, tun_name).await,
        Commands::CheckConfig { config } => cmd_check_config(config),
    }
}

async fn cmd_run(config_path: PathBuf, key: Option<String>, tun_name: Option<String>) -> Result<()> {
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    if let Some(key) = key {
        config.key = key;
    }
    if let Some(name) = tun_name {
        config.tun_name = name;
    }

    let tunnel = Tunnel::new(config, Some(config_path))?;
    tunnel.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutting down");
    tunnel.stop().await;

    Ok(())
}

fn cmd_check_config(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    println!("config ok: {}", config_path.display());
    println!("  mode:          {:?}", config.mode);
    println!("  tunnel_addr:   {}", config.tunnel_addr);
    println!("  multi_client:  {}", config.multi_client());
    println!("  max_clients:   {}", config.max_clients);
    println!("  encryption:    {}", !config.key.is_empty());
    println!("  p2p_enabled:   {}", config.p2p_enabled);
    Ok(())
}

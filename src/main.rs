//! LANShare node: serverless LAN chat and file transfer

use clap::Parser;
use lanshare::net::{NetConfig, Network, DEFAULT_DISCOVERY_PORT, DEFAULT_LISTEN_PORT};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lanshare", version, about = "LANShare: serverless LAN messenger")]
struct Args {
    /// Display name shown to other peers
    #[arg(short, long)]
    name: String,

    /// TCP port for peer sessions
    #[arg(short, long, default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,

    /// UDP port for discovery
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Local IP to advertise (auto-detected if not set)
    #[arg(short = 'i', long)]
    local_ip: Option<IpAddr>,

    /// Broadcast address for announces
    #[arg(short, long, default_value = "255.255.255.255")]
    broadcast: IpAddr,

    /// Where accepted files are saved
    #[arg(short, long, default_value = "./downloads")]
    download_dir: PathBuf,

    /// Do not announce or listen for peers
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanshare=info")),
        )
        .init();

    let args = Args::parse();

    info!("LANShare v{}", VERSION);

    let config = NetConfig {
        display_name: args.name,
        listen_port: args.port,
        discovery_port: args.discovery_port,
        local_ip: args.local_ip,
        broadcast_ip: args.broadcast,
        download_dir: args.download_dir,
        discovery_enabled: !args.no_discovery,
        ..Default::default()
    };

    let (network, event_rx) = match Network::bind(config).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = network.start().await {
        error!("Failed to start node: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        _ = lanshare::cli::run(network.clone(), event_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    network.shutdown().await;
}

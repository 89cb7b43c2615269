use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nghost::{
    config::Config,
    daemon::{
        connect_client, overlay::OverlayAddress, registry::PeerRecord, run_daemon, DaemonConfig,
    },
};

/// VPN over an overlay network
#[derive(Parser)]
#[command(name = "nghost")]
#[command(author, version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the VPN daemon until Ctrl-C
    Start {
        /// Bridge the virtual subnet to the Internet
        #[arg(long)]
        exit_node: bool,

        /// Overlay address of a peer to contact at startup
        #[arg(long = "peer")]
        peers: Vec<String>,
    },

    /// Contact a peer by its overlay address
    AddPeer { address: String },

    /// List peers heard from
    ListPeers {
        /// Seconds to listen for peers before listing them
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },

    /// Write the known peers to a JSON file
    ExportPeers {
        output: PathBuf,

        /// Seconds to listen for peers before exporting them
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },

    /// Look for exit nodes
    Discover {
        /// Seconds to keep looking
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&cli.config).context("Failed to load config")?;
    match cli.command {
        Commands::Start { exit_node, peers } => cmd_start(config, exit_node, peers).await,
        Commands::AddPeer { address } => cmd_add_peer(config, address).await,
        Commands::ListPeers { wait } => cmd_list_peers(config, wait).await,
        Commands::ExportPeers { output, wait } => cmd_export_peers(config, output, wait).await,
        Commands::Discover { timeout } => cmd_discover(config, timeout).await,
    }
}

async fn cmd_start(config: Config, exit_node: bool, manual_peers: Vec<String>) -> Result<()> {
    info!(
        "Starting nghost {}",
        if exit_node { "exit node" } else { "daemon" }
    );
    run_daemon(DaemonConfig {
        config,
        exit_node,
        manual_peers,
    })
    .await
    .context("Daemon failed")
}

async fn cmd_add_peer(config: Config, address: String) -> Result<()> {
    let client = connect_client(&config)
        .await
        .context("Failed to connect to the overlay")?;
    let reached = client.add_peer(&OverlayAddress::new(address.clone())).await;
    println!("Added peer: {}", address);
    if !reached {
        println!("The peer could not be contacted right now");
    }
    client.close().await?;
    Ok(())
}

async fn cmd_list_peers(config: Config, wait: u64) -> Result<()> {
    let client = connect_client(&config)
        .await
        .context("Failed to connect to the overlay")?;
    for address in &config.vpn.exit_nodes {
        client.add_peer(&OverlayAddress::new(address.clone())).await;
    }
    tokio::time::sleep(Duration::from_secs(wait)).await;

    let peers = client.peers();
    if peers.is_empty() {
        println!("No peers discovered yet.");
        println!("To add peers manually: nghost add-peer <overlay-address>");
    } else {
        print_peers(&peers);
        let exit_nodes = client.exit_nodes().len();
        if exit_nodes > 0 {
            println!("\nAvailable exit nodes: {}", exit_nodes);
        }
    }
    client.close().await?;
    Ok(())
}

fn print_peers(peers: &[PeerRecord]) {
    println!(
        "{:<20} {:<16} {:<8} {:<10} LAST SEEN",
        "ADDRESS", "IP", "STATUS", "EXIT NODE"
    );
    for peer in peers {
        let ip = peer.virtual_ip.map(|ip| ip.to_string()).unwrap_or_default();
        let status = if peer.online { "online" } else { "offline" };
        let exit_node = if peer.is_exit_node { "yes" } else { "no" };
        let last_seen = peer
            .last_seen
            .map(|last_seen| last_seen.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:<16} {:<8} {:<10} {}",
            peer.address.short(),
            ip,
            status,
            exit_node,
            last_seen
        );
    }
}

async fn cmd_export_peers(config: Config, output: PathBuf, wait: u64) -> Result<()> {
    let client = connect_client(&config)
        .await
        .context("Failed to connect to the overlay")?;
    tokio::time::sleep(Duration::from_secs(wait)).await;
    let peers = client.peers();
    client.close().await?;

    let data = serde_json::to_vec_pretty(&peers)?;
    tokio::fs::write(&output, data)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Exported {} peers to {}", peers.len(), output.display());
    Ok(())
}

async fn cmd_discover(config: Config, timeout: u64) -> Result<()> {
    let client = connect_client(&config)
        .await
        .context("Failed to connect to the overlay")?;
    for address in &config.vpn.exit_nodes {
        client.add_peer(&OverlayAddress::new(address.clone())).await;
    }
    println!("Looking for exit nodes for up to {} seconds...", timeout);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let exit_nodes = loop {
        poll.tick().await;
        let exit_nodes = client.exit_nodes();
        if !exit_nodes.is_empty() || tokio::time::Instant::now() >= deadline {
            break exit_nodes;
        }
    };

    if exit_nodes.is_empty() {
        println!("No exit nodes found.");
    } else {
        println!("Found {} exit node(s):", exit_nodes.len());
        print_peers(&exit_nodes);
    }
    client.close().await?;
    Ok(())
}

//! The nghost daemon. It is responsible for most of the program's functionality.

pub mod actors;
pub mod client;
pub mod engine;
pub mod error;
pub mod exit_node;
pub mod exit_select;
pub mod interface;
pub mod overlay;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

use std::{str::FromStr, sync::Arc};

use iroh_net::{key::SecretKey, ticket::NodeTicket};
use tokio::select;
use tracing::{info, warn};

use crate::config::{Config, OverlayConfig};

use self::{
    client::PeerClient,
    engine::Engine,
    overlay::{iroh::IrohOverlay, OverlayAddress, OverlaySession, Transport, CONNECT_TIMEOUT},
};

pub use error::DaemonError;

/// The nghost daemon configuration
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub config: Config,
    /// Bridge the virtual subnet to the Internet.
    pub exit_node: bool,
    /// Overlay addresses to register and ping at startup.
    pub manual_peers: Vec<String>,
}

/// Binds the overlay endpoint described by `config`.
///
/// A configured secret key fixes the node identity. Unparsable bootstrap tickets are skipped.
pub async fn connect_overlay(
    config: &OverlayConfig,
) -> Result<OverlaySession<IrohOverlay>, DaemonError> {
    let secret_key = match &config.secret_key {
        Some(secret_key) => SecretKey::from_str(secret_key)?,
        None => SecretKey::generate(),
    };
    let bootstrap: Vec<NodeTicket> = config
        .bootstrap
        .iter()
        .filter_map(|ticket| match NodeTicket::from_str(ticket) {
            Ok(ticket) => Some(ticket),
            Err(error) => {
                warn!("Skipping invalid bootstrap ticket {}: {}", ticket, error);
                None
            }
        })
        .collect();
    Ok(IrohOverlay::connect(secret_key, &bootstrap).await?)
}

/// Connects to the overlay as an inspection client. Bootstrap nodes are pinged right away.
pub async fn connect_client(config: &Config) -> Result<PeerClient<IrohOverlay>, DaemonError> {
    let session = connect_overlay(&config.overlay).await?;
    overlay::wait_connected(session.connected, CONNECT_TIMEOUT).await;
    let client = PeerClient::start(session.transport, session.inbound);
    for peer in &session.bootstrap {
        client.add_peer(peer).await;
    }
    Ok(client)
}

/// The nghost daemon. Runs until Ctrl-C or until a worker stops the engine.
pub async fn run_daemon(config: DaemonConfig) -> Result<(), DaemonError> {
    let settings = config.config.vpn_settings()?;
    let session = connect_overlay(&config.config.overlay).await?;
    info!("Overlay address: {}", session.local_address);
    overlay::wait_connected(session.connected, CONNECT_TIMEOUT).await;

    let transport = session.transport;
    let vpn = &config.config.vpn;
    let selector = exit_select::from_allow_list(&vpn.exit_nodes);
    let engine = Engine::new(
        settings,
        transport.clone(),
        OverlayAddress::new(config.config.overlay.discovery_address.clone()),
    )
    .with_selector(Arc::from(selector));
    info!("Virtual IP: {}", engine.self_ip());
    if !vpn.dns.is_empty() {
        info!("DNS servers: {}", vpn.dns.join(", "));
    }
    let configured = vpn.exit_nodes.iter().chain(&config.manual_peers);
    let peers = session
        .bootstrap
        .iter()
        .cloned()
        .chain(configured.map(|peer| OverlayAddress::new(peer.clone())));
    for peer in peers {
        engine.add_manual_peer(&peer).await;
    }

    let started = if config.exit_node {
        engine.start_exit_node(session.inbound).await
    } else {
        engine.start_daemon(session.inbound).await
    };
    if let Err(error) = started {
        if let Err(close_error) = transport.close().await {
            warn!("Failed to close overlay endpoint: {}", close_error);
        }
        return Err(error);
    }

    let result = select! {
        _ = engine.stopped() => Err(DaemonError::Died),
        signal = tokio::signal::ctrl_c() => {
            info!("Stopping...");
            signal.map_err(DaemonError::from)
        }
    };
    engine.stop().await;
    if let Err(error) = transport.close().await {
        warn!("Failed to close overlay endpoint: {}", error);
    }
    result
}

use thiserror::Error;

use crate::config::ConfigError;

use super::{exit_node::BootstrapError, interface::InterfaceError, overlay::TransportError};

/// Enum representing errors that can happen in nghost's daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("interface error: {0}")]
    Interface(#[from] InterfaceError),
    #[error("overlay transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("exit node bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid secret key: {0}")]
    KeyParsing(#[from] iroh_net::key::KeyParsingError),
    #[error("VPN engine already running")]
    AlreadyRunning,
    #[error("VPN engine was stopped and cannot be restarted")]
    Stopped,
    #[error("a daemon worker died")]
    Died,
}

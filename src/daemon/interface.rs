//! The virtual network interface.
//!
//! The engine only sees [VirtualInterface]. Two variants exist: a real TUN device, and a
//! diagnostic stand-in used when the device cannot be created.

pub mod simulation;
pub mod tun_device;

use std::{future::Future, net::Ipv4Addr, pin::Pin, sync::Arc};

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{error, warn};

pub use simulation::SimulatedInterface;
pub use tun_device::TunInterface;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to create TUN device: {0}")]
    Create(#[from] tun::Error),
    #[error("interface I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interface is closed")]
    Closed,
    #[error("no packet within the read timeout")]
    Timeout,
}

/// A future returned by [VirtualInterface] operations.
pub type InterfaceFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, InterfaceError>> + Send + 'a>>;

/// Capability of reading and writing whole IP packets.
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Reads one packet into `buffer`, returning its length. Waits until a packet arrives.
    fn read<'a>(&'a self, buffer: &'a mut [u8]) -> InterfaceFuture<'a, usize>;

    /// Writes one packet.
    fn write<'a>(&'a self, packet: &'a [u8]) -> InterfaceFuture<'a, ()>;

    /// Closes the interface. A pending [VirtualInterface::read] returns [InterfaceError::Closed].
    fn close(&self) -> InterfaceFuture<'_, ()>;
}

/// Creates the TUN device, falling back to the diagnostic stand-in if that fails.
pub fn open(
    name: &str,
    subnet: Ipv4Net,
    self_ip: Ipv4Addr,
    mtu: u16,
) -> Arc<dyn VirtualInterface> {
    match TunInterface::create(name, subnet, self_ip, mtu) {
        Ok(interface) => Arc::new(interface),
        Err(create_error) => {
            error!("Failed to create real TUN device: {}", create_error);
            warn!("Falling back to simulation mode, no traffic will be carried");
            Arc::new(SimulatedInterface::new(name, subnet, self_ip))
        }
    }
}

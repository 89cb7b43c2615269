//! Module for [Forwarder], the packet forwarding loop.
//!
//! It reads captured packets from the virtual interface one at a time and decides, per packet,
//! whether to tunnel it to a peer, drop it, or leave it to OS-level forwarding.

use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use ipnet::Ipv4Net;
use tracing::{debug, error, trace, warn};

use crate::daemon::{
    exit_select::ExitSelector,
    interface::{InterfaceError, VirtualInterface},
    overlay::{MessageKind, OverlayAddress, Transport},
    packet::{self, MAX_PACKET_SIZE, MIN_IPV4_HEADER_LEN},
    registry::PeerRegistry,
    routes::RouteTable,
    shutdown::Shutdown,
};

/// What to do with one captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Send the packet, unmodified, to this overlay address.
    Tunnel(OverlayAddress),
    /// This node is an exit node and the destination is off-subnet: the OS forwards it.
    LeaveToOs,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooShort,
    NotIpv4,
    NoRoute(Ipv4Addr),
    NoExitNode(Ipv4Addr),
}

pub struct Forwarder<T> {
    interface: Arc<dyn VirtualInterface>,
    transport: Arc<T>,
    routes: Arc<RouteTable>,
    registry: Arc<PeerRegistry>,
    selector: Arc<dyn ExitSelector>,
    subnet: Ipv4Net,
    exit_mode: Arc<AtomicBool>,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(
        interface: Arc<dyn VirtualInterface>,
        transport: Arc<T>,
        routes: Arc<RouteTable>,
        registry: Arc<PeerRegistry>,
        selector: Arc<dyn ExitSelector>,
        subnet: Ipv4Net,
        exit_mode: Arc<AtomicBool>,
    ) -> Self {
        Self {
            interface,
            transport,
            routes,
            registry,
            selector,
            subnet,
            exit_mode,
        }
    }

    /// Classifies a packet. Only the version and the destination address in the IPv4 header are
    /// inspected.
    pub fn classify(&self, packet: &[u8]) -> Verdict {
        if packet.len() < MIN_IPV4_HEADER_LEN {
            return Verdict::Drop(DropReason::TooShort);
        }
        let Some(destination) = packet::destination(packet) else {
            return Verdict::Drop(DropReason::NotIpv4);
        };
        if self.subnet.contains(&destination) {
            return match self.routes.find(destination) {
                Some(address) => Verdict::Tunnel(address),
                None => Verdict::Drop(DropReason::NoRoute(destination)),
            };
        }
        if self.exit_mode.load(Ordering::Acquire) {
            return Verdict::LeaveToOs;
        }
        let exit_nodes = self.registry.find_exit_nodes();
        match self.selector.select(&exit_nodes) {
            Some(address) => Verdict::Tunnel(address),
            None => Verdict::Drop(DropReason::NoExitNode(destination)),
        }
    }

    /// Handles one packet. A failed send drops the packet; nothing is retried.
    pub async fn forward(&self, packet: Bytes) {
        match self.classify(&packet) {
            Verdict::Tunnel(address) => {
                trace!("Tunneling {} bytes to {}", packet.len(), address.short());
                let sent = self.transport.send(&address, MessageKind::Data, packet).await;
                if let Err(error) = sent {
                    warn!("Failed to send packet via overlay: {}", error);
                }
            }
            Verdict::LeaveToOs => {}
            Verdict::Drop(reason) => trace!("Dropped packet: {:?}", reason),
        }
    }

    /// Reads and forwards packets until `shutdown` fires or the interface closes.
    ///
    /// An interface that closes on its own triggers `shutdown`, so the rest of the daemon stops
    /// with it.
    pub async fn run(self, shutdown: Shutdown) {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let read = tokio::select! {
                _ = shutdown.wait() => return,
                read = self.interface.read(&mut buffer) => read,
            };
            match read {
                Ok(size) => {
                    self.forward(Bytes::copy_from_slice(&buffer[..size])).await;
                }
                Err(InterfaceError::Timeout) => debug!("No packet from {}", self.interface.name()),
                Err(InterfaceError::Closed) => {
                    if !shutdown.is_triggered() {
                        error!("Interface {} closed", self.interface.name());
                        shutdown.trigger();
                    }
                    return;
                }
                Err(error) => warn!("Failed to read packet: {}", error),
            }
        }
    }
}

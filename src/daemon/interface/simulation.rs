//! A diagnostic stand-in for platforms where the TUN device cannot be created.
//!
//! It fabricates a test packet every few seconds and logs writes instead of transmitting
//! them. It never carries real traffic.

use std::{net::Ipv4Addr, time::Duration};

use ipnet::Ipv4Net;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::daemon::{packet, shutdown::Shutdown};

use super::{InterfaceError, InterfaceFuture, VirtualInterface};

const TEST_PACKET_INTERVAL: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_SIZE: usize = 100;

pub struct SimulatedInterface {
    name: String,
    packets: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Shutdown,
}

impl SimulatedInterface {
    /// Creates the stand-in and starts generating traffic from `self_ip` to the next address
    /// up.
    pub fn new(name: &str, subnet: Ipv4Net, self_ip: Ipv4Addr) -> Self {
        let (sender, packets) = mpsc::channel(QUEUE_SIZE);
        let closed = Shutdown::new();
        let neighbour = Ipv4Addr::from(u32::from(self_ip) + 1);
        let test_packet = packet::build_test_packet(self_ip, neighbour);
        tokio::spawn(generate_packets(sender, test_packet, closed.clone()));
        info!("Created simulation TUN device {} ({})", name, subnet);
        Self {
            name: name.to_string(),
            packets: Mutex::new(packets),
            closed,
        }
    }
}

async fn generate_packets(
    sender: mpsc::Sender<Vec<u8>>,
    test_packet: Vec<u8>,
    closed: Shutdown,
) {
    let mut interval = tokio::time::interval(TEST_PACKET_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = closed.wait() => return,
            _ = interval.tick() => {}
        }
        match sender.try_send(test_packet.clone()) {
            Ok(()) => debug!("Simulation: generated test packet ({} bytes)", test_packet.len()),
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

impl VirtualInterface for SimulatedInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn read<'a>(&'a self, buffer: &'a mut [u8]) -> InterfaceFuture<'a, usize> {
        Box::pin(async move {
            let mut packets = self.packets.lock().await;
            tokio::select! {
                _ = self.closed.wait() => Err(InterfaceError::Closed),
                received = tokio::time::timeout(READ_TIMEOUT, packets.recv()) => match received {
                    Ok(Some(packet)) => {
                        let size = packet.len().min(buffer.len());
                        buffer[..size].copy_from_slice(&packet[..size]);
                        Ok(size)
                    }
                    Ok(None) => Err(InterfaceError::Closed),
                    Err(_) => Err(InterfaceError::Timeout),
                },
            }
        })
    }

    fn write<'a>(&'a self, packet: &'a [u8]) -> InterfaceFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.is_triggered() {
                return Err(InterfaceError::Closed);
            }
            match packet::destination(packet) {
                Some(destination) => info!(
                    "Simulation: would deliver packet to {} ({} bytes)",
                    destination,
                    packet.len()
                ),
                None => info!("Simulation: would deliver {} bytes", packet.len()),
            }
            Ok(())
        })
    }

    fn close(&self) -> InterfaceFuture<'_, ()> {
        Box::pin(async move {
            self.closed.trigger();
            info!("Closed simulation TUN device {}", self.name);
            Ok(())
        })
    }
}

//! Module for [Injector] actor.
//!
//! It writes packets received from the overlay to the virtual interface.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::daemon::{interface::VirtualInterface, shutdown::Shutdown};

use super::{Actor, Addr};

const QUEUE_SIZE: usize = 256;

pub struct Injector {
    /// The address used to send packets to this injector.
    address: Addr<Bytes>,

    /// The receiver channel for packets to write.
    receiver: mpsc::Receiver<Bytes>,

    interface: Arc<dyn VirtualInterface>,
}

impl Injector {
    pub fn new(interface: Arc<dyn VirtualInterface>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_SIZE);
        Self {
            address: Addr::new(sender),
            receiver,
            interface,
        }
    }

    /// Writes queued packets until `shutdown` fires. Write failures drop the packet.
    pub async fn run(mut self, shutdown: Shutdown) {
        loop {
            let packet = tokio::select! {
                _ = shutdown.wait() => return,
                packet = self.receiver.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };
            match self.interface.write(&packet).await {
                Ok(()) => trace!("Injected {} bytes", packet.len()),
                Err(error) => warn!("Failed to inject packet: {}", error),
            }
        }
    }
}

impl Actor<Bytes> for Injector {
    fn get_addr(&self) -> Addr<Bytes> {
        self.address.clone()
    }
}

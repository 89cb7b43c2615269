//! A short-lived overlay participant for inspection commands.
//!
//! It answers control traffic and fills its own registry, but has no interface and never
//! announces itself.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};
use tracing::debug;

use super::{
    actors::{control_handler::ControlHandler, dispatcher::Dispatcher, Actor},
    overlay::{InboundMessage, OverlayAddress, Transport, TransportError},
    protocol::{self, ControlMessage},
    registry::{PeerRecord, PeerRegistry},
    routes::RouteTable,
    shutdown::Shutdown,
};

pub struct PeerClient<T> {
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    shutdown: Shutdown,
    workers: JoinSet<()>,
}

impl<T: Transport> PeerClient<T> {
    pub fn start(transport: Arc<T>, inbound: mpsc::Receiver<InboundMessage>) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        let shutdown = Shutdown::new();
        let control_handler = ControlHandler::new(
            transport.clone(),
            registry.clone(),
            Arc::new(RouteTable::new()),
        );
        let dispatcher = Dispatcher::new(inbound, control_handler.get_addr(), None);
        let mut workers = JoinSet::new();
        workers.spawn(control_handler.run(shutdown.clone()));
        workers.spawn(dispatcher.run(shutdown.clone()));
        Self {
            transport,
            registry,
            shutdown,
            workers,
        }
    }

    /// Records `address` and pings it. Returns whether the ping was sent.
    pub async fn add_peer(&self, address: &OverlayAddress) -> bool {
        self.registry.add_manual(address);
        match protocol::send_control(self.transport.as_ref(), address, &ControlMessage::Ping).await
        {
            Ok(()) => true,
            Err(error) => {
                debug!("Failed to ping {}: {}", address.short(), error);
                false
            }
        }
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.snapshot()
    }

    pub fn exit_nodes(&self) -> Vec<PeerRecord> {
        self.registry.find_exit_nodes()
    }

    /// Stops the workers and closes the transport.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.shutdown.trigger();
        while self.workers.join_next().await.is_some() {}
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::daemon::{
        overlay::MessageKind,
        protocol::PeerAnnouncement,
        testing::RecordingTransport,
    };

    #[tokio::test]
    async fn learns_peers_from_control_traffic() {
        let transport = Arc::new(RecordingTransport::default());
        let (inbound_sender, inbound) = mpsc::channel(8);
        let client = PeerClient::start(transport.clone(), inbound);
        let manual = OverlayAddress::from("manual");

        assert!(client.add_peer(&manual).await);
        inbound_sender
            .send(InboundMessage {
                source: OverlayAddress::from("exit"),
                kind: MessageKind::Control,
                payload: ControlMessage::PeerAnnouncement(PeerAnnouncement {
                    ip_address: "10.100.0.9".to_string(),
                    exit_node: true,
                })
                .encode()
                .unwrap(),
            })
            .await
            .unwrap();
        inbound_sender
            .send(InboundMessage {
                source: manual.clone(),
                kind: MessageKind::Data,
                payload: Bytes::from_static(b"ignored"),
            })
            .await
            .unwrap();
        while client.exit_nodes().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(client.peers().len(), 2);
        assert_eq!(client.exit_nodes()[0].address, OverlayAddress::from("exit"));
        client.close().await.unwrap();
        assert!(transport.is_closed());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_is_still_recorded() {
        let transport = Arc::new(RecordingTransport::default());
        let (_inbound_sender, inbound) = mpsc::channel(8);
        let client = PeerClient::start(transport.clone(), inbound);
        let peer = OverlayAddress::from("gone");
        transport.fail_sends_to(&peer);

        assert!(!client.add_peer(&peer).await);
        assert_eq!(client.peers()[0].address, peer);
        client.close().await.unwrap();
    }
}

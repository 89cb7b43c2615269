//! Module for [ControlHandler] actor.
//!
//! It is responsible for reacting to control messages from other nodes. Apart from the peer
//! registry and route table it keeps no state.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::daemon::{
    overlay::{OverlayAddress, Transport},
    protocol::{self, ControlMessage, PeerAnnouncement},
    registry::PeerRegistry,
    routes::RouteTable,
    shutdown::Shutdown,
};

use super::{Actor, Addr};

const QUEUE_SIZE: usize = 64;

/// A control message still in wire form, with its sender.
#[derive(Debug, Clone)]
pub struct ControlEnvelope {
    pub source: OverlayAddress,
    pub payload: Bytes,
}

pub struct ControlHandler<T> {
    address: Addr<ControlEnvelope>,
    receiver: mpsc::Receiver<ControlEnvelope>,
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
}

impl<T: Transport> ControlHandler<T> {
    pub fn new(transport: Arc<T>, registry: Arc<PeerRegistry>, routes: Arc<RouteTable>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_SIZE);
        Self {
            address: Addr::new(sender),
            receiver,
            transport,
            registry,
            routes,
        }
    }

    /// Handles queued messages one at a time until `shutdown` fires.
    pub async fn run(mut self, shutdown: Shutdown) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.wait() => return,
                envelope = self.receiver.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };
            self.handle(&envelope.source, &envelope.payload).await;
        }
    }

    /// Reacts to one control message. Malformed and unknown messages are dropped.
    pub async fn handle(&self, source: &OverlayAddress, payload: &[u8]) {
        let message = match ControlMessage::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                trace!("Dropped control message from {}: {}", source.short(), error);
                return;
            }
        };
        match message {
            ControlMessage::Ping => self.handle_ping(source).await,
            ControlMessage::Pong(_) => {
                self.registry.touch(source);
            }
            ControlMessage::PeerAnnouncement(announcement) => {
                self.handle_announcement(source, &announcement)
            }
        }
    }

    async fn handle_ping(&self, source: &OverlayAddress) {
        let pong = ControlMessage::pong_now();
        if let Err(error) = protocol::send_control(self.transport.as_ref(), source, &pong).await {
            debug!("Failed to answer ping from {}: {}", source.short(), error);
        }
    }

    fn handle_announcement(&self, source: &OverlayAddress, announcement: &PeerAnnouncement) {
        let attributes = match announcement.attributes() {
            Ok(attributes) => attributes,
            Err(error) => {
                trace!("Dropped announcement from {}: {}", source.short(), error);
                return;
            }
        };
        self.registry.upsert(source, attributes);
        debug!(
            "Peer {} announced: IP={:?}, exit node={}",
            source.short(),
            attributes.virtual_ip,
            attributes.is_exit_node
        );
        if let Some(virtual_ip) = attributes.virtual_ip {
            self.routes.add_host(virtual_ip, source.clone());
        }
    }
}

impl<T: Transport> Actor<ControlEnvelope> for ControlHandler<T> {
    fn get_addr(&self) -> Addr<ControlEnvelope> {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::daemon::{overlay::MessageKind, testing::RecordingTransport};

    struct Fixture {
        transport: Arc<RecordingTransport>,
        registry: Arc<PeerRegistry>,
        routes: Arc<RouteTable>,
        handler: ControlHandler<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let registry = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let handler = ControlHandler::new(transport.clone(), registry.clone(), routes.clone());
        Fixture {
            transport,
            registry,
            routes,
            handler,
        }
    }

    fn announcement(ip_address: &str, exit_node: bool) -> Bytes {
        ControlMessage::PeerAnnouncement(PeerAnnouncement {
            ip_address: ip_address.to_string(),
            exit_node,
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn ping_is_answered_with_one_pong() {
        let fixture = fixture();
        let stranger = OverlayAddress::from("stranger");

        fixture
            .handler
            .handle(&stranger, &ControlMessage::Ping.encode().unwrap())
            .await;

        let sent = fixture.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, stranger);
        assert_eq!(sent[0].kind, MessageKind::Control);
        assert!(matches!(
            ControlMessage::decode(&sent[0].payload).unwrap(),
            ControlMessage::Pong(Some(_))
        ));
        assert!(fixture.registry.is_empty());

        fixture.registry.add_manual(&stranger);
        fixture
            .handler
            .handle(&stranger, &ControlMessage::Ping.encode().unwrap())
            .await;
        assert_eq!(fixture.transport.sent().len(), 2);
        assert!(!fixture.registry.get(&stranger).unwrap().online);
    }

    #[tokio::test]
    async fn pong_never_creates_records() {
        let fixture = fixture();
        let known = OverlayAddress::from("known");
        fixture.registry.add_manual(&known);
        let pong = ControlMessage::Pong(Some(1)).encode().unwrap();

        fixture.handler.handle(&OverlayAddress::from("stranger"), &pong).await;
        fixture.handler.handle(&known, &pong).await;

        assert_eq!(fixture.registry.len(), 1);
        assert!(fixture.registry.get(&known).unwrap().online);
        assert!(fixture.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn announcements_update_registry_and_routes() {
        let fixture = fixture();
        let peer = OverlayAddress::from("peer");

        for _ in 0..3 {
            fixture
                .handler
                .handle(&peer, &announcement("10.100.0.5", false))
                .await;
        }
        fixture
            .handler
            .handle(&peer, &announcement("10.100.0.5", true))
            .await;

        assert_eq!(fixture.registry.len(), 1);
        let record = fixture.registry.get(&peer).unwrap();
        assert!(record.is_exit_node);
        assert!(record.online);
        assert_eq!(record.virtual_ip, Some(Ipv4Addr::new(10, 100, 0, 5)));
        assert_eq!(fixture.routes.len(), 1);
        assert_eq!(fixture.routes.find(Ipv4Addr::new(10, 100, 0, 5)), Some(peer));
    }

    #[tokio::test]
    async fn announcement_without_address_adds_no_route() {
        let fixture = fixture();
        let peer = OverlayAddress::from("peer");

        fixture.handler.handle(&peer, &announcement("", true)).await;

        assert!(fixture.registry.get(&peer).unwrap().is_exit_node);
        assert!(fixture.routes.is_empty());
    }

    #[tokio::test]
    async fn junk_leaves_registry_unchanged() {
        let fixture = fixture();
        let peer = OverlayAddress::from("peer");

        for junk in [
            &br#"{"type":"teleport","payload":{"ipAddress":"10.100.0.5"}}"#[..],
            &br#"{"type":"peer_announcement","payload":"nope"}"#[..],
            &br#"{"type":"peer_announcement","payload":{"ipAddress":"ten"}}"#[..],
            &b"\xff\xfe"[..],
        ] {
            fixture.handler.handle(&peer, junk).await;
        }

        assert!(fixture.registry.is_empty());
        assert!(fixture.routes.is_empty());
        assert!(fixture.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn queued_messages_are_handled_until_shutdown() {
        let fixture = fixture();
        let address = fixture.handler.get_addr();
        let shutdown = Shutdown::new();
        let worker = tokio::spawn(fixture.handler.run(shutdown.clone()));

        address
            .send_message(ControlEnvelope {
                source: OverlayAddress::from("peer"),
                payload: announcement("10.100.0.8", false),
            })
            .await;
        while fixture.registry.is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.trigger();
        worker.await.unwrap();

        assert_eq!(
            fixture.routes.find(Ipv4Addr::new(10, 100, 0, 8)),
            Some(OverlayAddress::from("peer"))
        );
    }
}

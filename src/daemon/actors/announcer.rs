//! Module for [Announcer], the periodic self-announcement loop.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::daemon::{
    overlay::{OverlayAddress, Transport, TransportError},
    protocol::{self, PeerAnnouncement},
    registry::PeerRegistry,
    shutdown::Shutdown,
};

/// Delay before the first announcement, giving the overlay time to settle.
pub const INITIAL_DELAY: Duration = Duration::from_secs(2);
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
/// Peers silent for this long are marked offline.
pub const STALE_AFTER: Duration = Duration::from_secs(90);

pub struct Announcer<T> {
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    discovery: OverlayAddress,
    announcement: PeerAnnouncement,
}

impl<T: Transport> Announcer<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<PeerRegistry>,
        discovery: OverlayAddress,
        announcement: PeerAnnouncement,
    ) -> Self {
        Self {
            transport,
            registry,
            discovery,
            announcement,
        }
    }

    pub async fn run(self, shutdown: Shutdown) {
        let mut ticks = interval_at(Instant::now() + INITIAL_DELAY, ANNOUNCE_INTERVAL);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_after = chrono::Duration::seconds(STALE_AFTER.as_secs() as i64);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = ticks.tick() => {}
            }
            self.registry.mark_stale(Utc::now(), stale_after);
            debug!(
                "Announcing {} (exit node: {})",
                self.announcement.ip_address, self.announcement.exit_node
            );
            let result = protocol::announce(
                self.transport.as_ref(),
                &self.registry,
                &self.discovery,
                &self.announcement,
            )
            .await;
            match result {
                Ok(()) => {}
                // The default discovery address names no node; known peers were still reached.
                Err(TransportError::InvalidAddress(address)) => {
                    debug!("Discovery address {} is not reachable, skipped", address)
                }
                Err(error) => warn!("Failed to announce to discovery: {}", error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::daemon::{protocol::ControlMessage, testing::RecordingTransport};

    fn announcer(transport: Arc<RecordingTransport>) -> Announcer<RecordingTransport> {
        announcer_with(transport, Arc::new(PeerRegistry::new()))
    }

    fn announcer_with(
        transport: Arc<RecordingTransport>,
        registry: Arc<PeerRegistry>,
    ) -> Announcer<RecordingTransport> {
        Announcer::new(
            transport,
            registry,
            OverlayAddress::from("discovery"),
            PeerAnnouncement::new(Ipv4Addr::new(10, 100, 0, 1), true),
        )
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announces_after_delay_and_then_periodically() {
        let transport = Arc::new(RecordingTransport::default());
        let shutdown = Shutdown::new();
        let worker = tokio::spawn(announcer(transport.clone()).run(shutdown.clone()));

        settle().await;
        assert!(transport.sent().is_empty());

        tokio::time::sleep(INITIAL_DELAY).await;
        settle().await;
        assert_eq!(transport.sent().len(), 1);
        assert!(matches!(
            ControlMessage::decode(&transport.sent()[0].payload).unwrap(),
            ControlMessage::PeerAnnouncement(announcement) if announcement.exit_node
        ));

        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        settle().await;
        assert_eq!(transport.sent().len(), 2);

        shutdown.trigger();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_failures_do_not_stop_announcing() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail_sends_to(&OverlayAddress::from("discovery"));
        let shutdown = Shutdown::new();
        let worker = tokio::spawn(announcer(transport.clone()).run(shutdown.clone()));

        tokio::time::sleep(INITIAL_DELAY + ANNOUNCE_INTERVAL * 2).await;
        settle().await;

        assert!(!worker.is_finished());
        shutdown.trigger();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_discovery_address_still_reaches_known_peers() {
        let transport = Arc::new(RecordingTransport::default());
        transport.reject_address(&OverlayAddress::from("discovery"));
        let registry = Arc::new(PeerRegistry::new());
        let peer = OverlayAddress::from("bootstrap");
        registry.add_manual(&peer);
        let shutdown = Shutdown::new();
        let announcer = announcer_with(transport.clone(), registry);
        let worker = tokio::spawn(announcer.run(shutdown.clone()));

        tokio::time::sleep(INITIAL_DELAY + ANNOUNCE_INTERVAL).await;
        settle().await;

        let destinations: Vec<_> = transport
            .sent()
            .into_iter()
            .map(|message| message.destination)
            .collect();
        assert_eq!(destinations, vec![peer.clone(), peer]);
        shutdown.trigger();
        worker.await.unwrap();
    }
}

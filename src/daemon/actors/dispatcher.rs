//! Module for [Dispatcher] actor.
//!
//! It sorts inbound overlay messages by their adapter-level kind: data goes to the injector and
//! control goes to the control handler. Both queues are bounded and a full queue drops the
//! message, so a burst of control traffic cannot hold up packet delivery.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::daemon::{
    overlay::{InboundMessage, MessageKind},
    shutdown::Shutdown,
};

use super::{control_handler::ControlEnvelope, Addr};

pub struct Dispatcher {
    inbound: mpsc::Receiver<InboundMessage>,
    control: Addr<ControlEnvelope>,
    /// [None] when nothing consumes packets, as in peer inspection commands.
    data: Option<Addr<Bytes>>,
}

impl Dispatcher {
    pub fn new(
        inbound: mpsc::Receiver<InboundMessage>,
        control: Addr<ControlEnvelope>,
        data: Option<Addr<Bytes>>,
    ) -> Self {
        Self {
            inbound,
            control,
            data,
        }
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        loop {
            let message = tokio::select! {
                _ = shutdown.wait() => return,
                message = self.inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("Overlay message stream closed");
                        return;
                    }
                },
            };
            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        match message.kind {
            MessageKind::Data => {
                let Some(data) = &self.data else {
                    return;
                };
                if !data.try_send_message(message.payload) {
                    trace!("Packet queue full, dropped packet from {}", message.source.short());
                }
            }
            MessageKind::Control => {
                let source = message.source.clone();
                let envelope = ControlEnvelope {
                    source: message.source,
                    payload: message.payload,
                };
                if !self.control.try_send_message(envelope) {
                    debug!("Control queue full, dropped message from {}", source.short());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::overlay::OverlayAddress;

    fn message(kind: MessageKind, payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            source: OverlayAddress::from("peer"),
            kind,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn routes_by_kind() {
        let (inbound_sender, inbound) = mpsc::channel(8);
        let (control_sender, mut control) = mpsc::channel(8);
        let (data_sender, mut data) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(
            inbound,
            Addr::new(control_sender),
            Some(Addr::new(data_sender)),
        );
        let shutdown = Shutdown::new();
        let worker = tokio::spawn(dispatcher.run(shutdown.clone()));

        inbound_sender.send(message(MessageKind::Data, b"packet")).await.unwrap();
        inbound_sender.send(message(MessageKind::Control, b"{}")).await.unwrap();

        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"packet"));
        let envelope = control.recv().await.unwrap();
        assert_eq!(envelope.source, OverlayAddress::from("peer"));
        assert_eq!(envelope.payload, Bytes::from_static(b"{}"));

        drop(inbound_sender);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn full_control_queue_does_not_block_data() {
        let (inbound_sender, inbound) = mpsc::channel(16);
        let (control_sender, mut control) = mpsc::channel(1);
        let (data_sender, mut data) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(
            inbound,
            Addr::new(control_sender),
            Some(Addr::new(data_sender)),
        );
        let shutdown = Shutdown::new();
        let worker = tokio::spawn(dispatcher.run(shutdown.clone()));

        for _ in 0..5 {
            inbound_sender.send(message(MessageKind::Control, b"{}")).await.unwrap();
        }
        inbound_sender.send(message(MessageKind::Data, b"packet")).await.unwrap();

        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"packet"));
        shutdown.trigger();
        worker.await.unwrap();
        assert!(control.recv().await.is_some());
        assert!(control.try_recv().is_err());
    }
}

//! Control-plane wire format and outbound control operations.
//!
//! Control messages are JSON objects of the form `{"type": ..., "payload": ...}`. Decoding is
//! lenient about payload fields so that newer peers can add to them.

use std::net::Ipv4Addr;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{
    overlay::{MessageKind, OverlayAddress, Transport, TransportError},
    registry::{PeerAttributes, PeerRegistry},
};

const PING: &str = "ping";
const PONG: &str = "pong";
const PEER_ANNOUNCEMENT: &str = "peer_announcement";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown control message type {0:?}")]
    UnknownType(String),
    #[error("announced address {0:?} is not an IPv4 address")]
    BadAddress(String),
}

/// Payload of a `peer_announcement`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub exit_node: bool,
}

impl PeerAnnouncement {
    pub fn new(virtual_ip: Ipv4Addr, exit_node: bool) -> Self {
        Self {
            ip_address: virtual_ip.to_string(),
            exit_node,
        }
    }

    /// Converts to registry attributes. An empty address means the peer has none.
    pub fn attributes(&self) -> Result<PeerAttributes, ProtocolError> {
        let virtual_ip = match self.ip_address.trim() {
            "" => None,
            address => Some(
                address
                    .parse()
                    .map_err(|_| ProtocolError::BadAddress(address.to_string()))?,
            ),
        };
        Ok(PeerAttributes {
            virtual_ip,
            is_exit_node: self.exit_node,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    /// Carries the sender's unix timestamp, when it sent one.
    Pong(Option<i64>),
    PeerAnnouncement(PeerAnnouncement),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ControlMessage {
    pub fn pong_now() -> Self {
        Self::Pong(Some(Utc::now().timestamp()))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let envelope = match self {
            Self::Ping => Envelope {
                kind: PING.to_string(),
                payload: Value::Null,
            },
            Self::Pong(timestamp) => Envelope {
                kind: PONG.to_string(),
                payload: serde_json::to_value(timestamp)?,
            },
            Self::PeerAnnouncement(announcement) => Envelope {
                kind: PEER_ANNOUNCEMENT.to_string(),
                payload: serde_json::to_value(announcement)?,
            },
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        match envelope.kind.as_str() {
            PING => Ok(Self::Ping),
            PONG => Ok(Self::Pong(serde_json::from_value(envelope.payload).ok())),
            PEER_ANNOUNCEMENT => Ok(Self::PeerAnnouncement(serde_json::from_value(
                envelope.payload,
            )?)),
            _ => Err(ProtocolError::UnknownType(envelope.kind)),
        }
    }
}

/// Sends a control message to `destination`.
pub async fn send_control<T: Transport>(
    transport: &T,
    destination: &OverlayAddress,
    message: &ControlMessage,
) -> Result<(), TransportError> {
    // Encoding our own messages cannot fail: every payload is a plain value.
    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(error) => {
            debug!("Not sending unencodable control message: {}", error);
            return Ok(());
        }
    };
    transport
        .send(destination, MessageKind::Control, payload)
        .await
}

/// Announces this node to the discovery address and, for redundancy, to every known peer.
///
/// Delivery is at-least-once; receivers apply announcements idempotently. Failures towards
/// individual peers are only logged. The discovery send's result is returned.
pub async fn announce<T: Transport>(
    transport: &T,
    registry: &PeerRegistry,
    discovery: &OverlayAddress,
    announcement: &PeerAnnouncement,
) -> Result<(), TransportError> {
    let message = ControlMessage::PeerAnnouncement(announcement.clone());
    let result = send_control(transport, discovery, &message).await;
    for peer in registry.addresses() {
        if &peer == discovery {
            continue;
        }
        if let Err(error) = send_control(transport, &peer, &message).await {
            debug!("Announcement to {} failed: {}", peer.short(), error);
        }
    }
    result
}

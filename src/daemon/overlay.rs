//! The overlay transport adapter.
//!
//! The overlay network delivers authenticated messages between opaque identities. This module
//! defines what the rest of the daemon needs from it: sending a message tagged as data or
//! control, and a stream of inbound messages carrying the same tag.

pub mod iroh;

use std::{fmt, future::Future, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// How long callers wait for the connected event before continuing in degraded mode.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An overlay identity. Treated as an opaque string everywhere except inside the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OverlayAddress(String);

impl OverlayAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> String {
        match self.0.char_indices().nth(16) {
            Some((index, _)) => format!("{}...", &self.0[..index]),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OverlayAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for OverlayAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Adapter-level flag telling consumers how to interpret a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A raw captured IP packet.
    Data,
    /// A protocol message for the control plane.
    Control,
}

impl MessageKind {
    pub fn flag(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Control => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::Data),
            1 => Some(Self::Control),
            _ => None,
        }
    }
}

/// A message received from the overlay.
#[derive(Clone)]
pub struct InboundMessage {
    pub source: OverlayAddress,
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("source", &self.source.short())
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind overlay endpoint: {0}")]
    Bind(String),
    #[error("not a valid overlay address: {0}")]
    InvalidAddress(OverlayAddress),
    #[error("failed to connect to {address}: {reason}")]
    Connect {
        address: OverlayAddress,
        reason: String,
    },
    #[error("failed to send to {address}: {reason}")]
    Send {
        address: OverlayAddress,
        reason: String,
    },
    #[error("message of {0} bytes exceeds the overlay message limit")]
    TooLarge(usize),
    #[error("failed to close overlay endpoint: {0}")]
    Close(String),
}

/// The sending half of an overlay connection.
pub trait Transport: Send + Sync + 'static {
    /// Sends one message. Delivery is not acknowledged and never retried.
    fn send(
        &self,
        destination: &OverlayAddress,
        kind: MessageKind,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Everything [iroh::IrohOverlay::connect] hands back.
pub struct OverlaySession<T> {
    pub transport: std::sync::Arc<T>,
    pub local_address: OverlayAddress,
    /// Nodes the endpoint was seeded with, to be contacted at startup.
    pub bootstrap: Vec<OverlayAddress>,
    /// Fires once the endpoint has reached the overlay.
    pub connected: oneshot::Receiver<()>,
    /// Unordered stream of inbound data and control messages.
    pub inbound: mpsc::Receiver<InboundMessage>,
}

/// Waits up to `limit` for the connected event. Returns whether it fired.
///
/// Not getting it is not an error: the overlay may finish routing asynchronously, so the caller
/// carries on in degraded mode.
pub async fn wait_connected(connected: oneshot::Receiver<()>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, connected).await {
        Ok(Ok(())) => {
            info!("Overlay endpoint connected");
            true
        }
        Ok(Err(_)) | Err(_) => {
            warn!("Overlay connection not confirmed after {:?}, continuing anyway", limit);
            false
        }
    }
}

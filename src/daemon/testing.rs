//! In-memory doubles for the transport, the virtual interface and the command runner.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    exit_node::{BootstrapError, CommandFuture, CommandRunner},
    interface::{InterfaceError, InterfaceFuture, VirtualInterface},
    overlay::{MessageKind, OverlayAddress, Transport, TransportError},
    shutdown::Shutdown,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: OverlayAddress,
    pub kind: MessageKind,
    pub payload: Bytes,
}

/// Records every successful send. Sends to addresses marked with
/// [RecordingTransport::fail_sends_to] or [RecordingTransport::reject_address] fail and are not
/// recorded.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<OverlayAddress>>,
    invalid: Mutex<HashSet<OverlayAddress>>,
    closed: Shutdown,
}

impl RecordingTransport {
    pub fn fail_sends_to(&self, address: &OverlayAddress) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone());
    }

    /// Makes sends to `address` fail the way an unparsable overlay address does.
    pub fn reject_address(&self, address: &OverlayAddress) {
        self.invalid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }
}

impl Transport for RecordingTransport {
    async fn send(
        &self,
        destination: &OverlayAddress,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let invalid = self
            .invalid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(destination);
        if invalid {
            return Err(TransportError::InvalidAddress(destination.clone()));
        }
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(destination);
        if failing || self.closed.is_triggered() {
            return Err(TransportError::Send {
                address: destination.clone(),
                reason: "unreachable".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                destination: destination.clone(),
                kind,
                payload,
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.trigger();
        Ok(())
    }
}

/// A virtual interface fed from a channel. Writes are kept for inspection.
pub struct MemoryInterface {
    packets: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    written: Mutex<Vec<Bytes>>,
    closed: Shutdown,
}

impl MemoryInterface {
    /// Returns the interface and the sender that feeds its reads.
    pub fn new() -> (std::sync::Arc<Self>, mpsc::Sender<Bytes>) {
        let (sender, packets) = mpsc::channel(16);
        let interface = Self {
            packets: tokio::sync::Mutex::new(packets),
            written: Mutex::default(),
            closed: Shutdown::new(),
        };
        (std::sync::Arc::new(interface), sender)
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }
}

impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        "memory0"
    }

    fn read<'a>(&'a self, buffer: &'a mut [u8]) -> InterfaceFuture<'a, usize> {
        Box::pin(async move {
            let mut packets = self.packets.lock().await;
            let packet = tokio::select! {
                _ = self.closed.wait() => return Err(InterfaceError::Closed),
                packet = packets.recv() => packet.ok_or(InterfaceError::Closed)?,
            };
            let size = packet.len().min(buffer.len());
            buffer[..size].copy_from_slice(&packet[..size]);
            Ok(size)
        })
    }

    fn write<'a>(&'a self, packet: &'a [u8]) -> InterfaceFuture<'a, ()> {
        Box::pin(async move {
            if self.closed.is_triggered() {
                return Err(InterfaceError::Closed);
            }
            self.written
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Bytes::copy_from_slice(packet));
            Ok(())
        })
    }

    fn close(&self) -> InterfaceFuture<'_, ()> {
        Box::pin(async move {
            self.closed.trigger();
            Ok(())
        })
    }
}

/// Records commands instead of running them. Commands containing the failing pattern fail but
/// are still recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    failing: Option<String>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn failing(pattern: &str) -> Self {
        Self {
            failing: Some(pattern.to_string()),
            commands: Mutex::default(),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> CommandFuture<'a> {
        Box::pin(async move {
            let command = format!("{} {}", program, args.join(" "));
            self.commands
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(command.clone());
            match &self.failing {
                Some(pattern) if command.contains(pattern.as_str()) => {
                    Err(BootstrapError::Failed {
                        command,
                        status: "exit status: 1".to_string(),
                        stderr: "scripted failure".to_string(),
                    })
                }
                _ => Ok(()),
            }
        })
    }
}

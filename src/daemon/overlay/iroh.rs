//! [Transport] over Iroh's magic endpoint.
//!
//! Every message is framed the same way: one [MessageKind] flag byte, then the payload. Control
//! messages travel on their own unidirectional QUIC stream. Data packets go out as unreliable
//! QUIC datagrams, or on a stream when they do not fit the connection's datagram limit. Nothing
//! waits for the peer to acknowledge a message.
//!
//! Connections are cached per remote node and used in both directions. A data packet for a node
//! with no open connection starts a dial in the background and is sent once it completes, so the
//! forwarding loop never waits on a handshake.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use iroh_net::{
    key::SecretKey, magic_endpoint::get_remote_node_id, relay::RelayMode, ticket::NodeTicket,
    MagicEndpoint, NodeAddr, NodeId,
};
use quinn::{Connecting, Connection, RecvStream, VarInt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::daemon::shutdown::Shutdown;

use super::{InboundMessage, MessageKind, OverlayAddress, OverlaySession, Transport, TransportError};

const ALPN: &[u8] = "nghost/0".as_bytes();

/// Largest payload accepted, plus one byte for the kind flag.
const MAX_MESSAGE_SIZE: usize = 65_536 + 1;

const INBOUND_QUEUE_SIZE: usize = 256;

const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(200);

type ConnectionMap = Arc<Mutex<HashMap<NodeId, Connection>>>;

/// Endpoint state shared with the per-connection tasks.
#[derive(Clone)]
struct Links {
    magic_endpoint: MagicEndpoint,
    connections: ConnectionMap,
    /// Nodes with a background dial in flight.
    dialing: Arc<Mutex<HashSet<NodeId>>>,
    inbound_sender: mpsc::Sender<InboundMessage>,
    shutdown: Shutdown,
}

pub struct IrohOverlay {
    links: Links,
}

impl IrohOverlay {
    /// Binds an endpoint with the given identity and starts accepting peers.
    ///
    /// `bootstrap` tickets are added to the endpoint's address book so the first messages to
    /// those nodes can be routed before any discovery happens. Their node ids are handed back in
    /// [OverlaySession::bootstrap].
    pub async fn connect(
        secret_key: SecretKey,
        bootstrap: &[NodeTicket],
    ) -> Result<OverlaySession<Self>, TransportError> {
        Self::bind(secret_key, bootstrap, RelayMode::Default).await
    }

    pub(crate) async fn bind(
        secret_key: SecretKey,
        bootstrap: &[NodeTicket],
        relay_mode: RelayMode,
    ) -> Result<OverlaySession<Self>, TransportError> {
        let magic_endpoint = MagicEndpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![ALPN.to_vec()])
            .relay_mode(relay_mode)
            .bind(0)
            .await
            .map_err(|error| TransportError::Bind(format!("{error:#}")))?;
        let mut bootstrap_peers = Vec::with_capacity(bootstrap.len());
        for ticket in bootstrap {
            let node_id = ticket.node_addr().node_id;
            if let Err(error) = magic_endpoint.add_node_addr(ticket.node_addr().clone()) {
                warn!("Skipping bootstrap node {}: {:#}", node_id, error);
                continue;
            }
            bootstrap_peers.push(OverlayAddress::new(node_id.to_string()));
        }

        let local_address = OverlayAddress::new(magic_endpoint.node_id().to_string());
        let (inbound_sender, inbound) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (connected_sender, connected) = oneshot::channel();
        let links = Links {
            magic_endpoint,
            connections: Arc::new(Mutex::new(HashMap::new())),
            dialing: Arc::new(Mutex::new(HashSet::new())),
            inbound_sender,
            shutdown: Shutdown::new(),
        };

        tokio::spawn(task_watch_relay(
            links.magic_endpoint.clone(),
            connected_sender,
            links.shutdown.clone(),
        ));
        tokio::spawn(links.clone().task_accept_peers());
        info!("Overlay endpoint bound as {}", local_address);

        Ok(OverlaySession {
            transport: Arc::new(Self { links }),
            local_address,
            bootstrap: bootstrap_peers,
            connected,
            inbound,
        })
    }
}

/// Fires the connected event once a home relay is known.
async fn task_watch_relay(
    magic_endpoint: MagicEndpoint,
    connected: oneshot::Sender<()>,
    shutdown: Shutdown,
) {
    loop {
        if let Some(relay) = magic_endpoint.my_relay() {
            debug!("Home relay is {}", relay);
            let _ = connected.send(());
            return;
        }
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(RELAY_POLL_INTERVAL) => {}
        }
    }
}

impl Links {
    async fn task_accept_peers(self) {
        loop {
            let connecting = tokio::select! {
                _ = self.shutdown.wait() => return,
                connecting = self.magic_endpoint.accept() => match connecting {
                    Some(connecting) => connecting,
                    None => return,
                },
            };
            tokio::spawn(self.clone().task_add_peer(connecting));
        }
    }

    async fn task_add_peer(self, connecting: Connecting) {
        let connection = match connecting.await {
            Ok(connection) => connection,
            Err(error) => {
                debug!("Incoming connection failed: {}", error);
                return;
            }
        };
        let node_id = match get_remote_node_id(&connection) {
            Ok(node_id) => node_id,
            Err(error) => {
                debug!("Incoming connection without a node id: {:#}", error);
                return;
            }
        };
        trace!("Accepted connection from {}", node_id);
        self.connections
            .lock()
            .await
            .insert(node_id, connection.clone());
        self.task_receive(node_id, connection).await;
    }

    /// Reads streams and datagrams off one connection until it closes.
    async fn task_receive(self, node_id: NodeId, connection: Connection) {
        let source = OverlayAddress::new(node_id.to_string());
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.wait() => return,
                stream = connection.accept_uni() => match stream {
                    Ok(stream) => read_stream(stream).await,
                    Err(error) => {
                        debug!("Connection to {} closed: {}", source.short(), error);
                        break;
                    }
                },
                datagram = connection.read_datagram() => match datagram {
                    Ok(datagram) => decode_frame(datagram),
                    Err(error) => {
                        debug!("Connection to {} closed: {}", source.short(), error);
                        break;
                    }
                },
            };
            match frame {
                Some((kind, payload)) => {
                    let message = InboundMessage {
                        source: source.clone(),
                        kind,
                        payload,
                    };
                    if self.inbound_sender.send(message).await.is_err() {
                        return;
                    }
                }
                None => trace!("Dropped unreadable message from {}", source.short()),
            }
        }
        self.forget(node_id, &connection).await;
    }

    /// Removes `connection` from the cache unless it has already been replaced.
    async fn forget(&self, node_id: NodeId, connection: &Connection) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(&node_id)
            .is_some_and(|cached| cached.stable_id() == connection.stable_id())
        {
            connections.remove(&node_id);
        }
    }

    async fn cached(&self, node_id: NodeId) -> Option<Connection> {
        self.connections
            .lock()
            .await
            .get(&node_id)
            .filter(|connection| connection.close_reason().is_none())
            .cloned()
    }

    async fn connection_to(
        &self,
        node_id: NodeId,
        address: &OverlayAddress,
    ) -> Result<Connection, TransportError> {
        if let Some(connection) = self.cached(node_id).await {
            return Ok(connection);
        }
        let connection = self
            .magic_endpoint
            .connect(NodeAddr::new(node_id), ALPN)
            .await
            .map_err(|error| TransportError::Connect {
                address: address.clone(),
                reason: format!("{error:#}"),
            })?;
        trace!("Connected to {}", address.short());
        self.connections
            .lock()
            .await
            .insert(node_id, connection.clone());
        tokio::spawn(self.clone().task_receive(node_id, connection.clone()));
        Ok(connection)
    }

    /// Sends a frame on `connection`, dropping the connection from the cache if that fails.
    async fn send_on(
        &self,
        node_id: NodeId,
        address: &OverlayAddress,
        connection: &Connection,
        kind: MessageKind,
        frame: Bytes,
    ) -> Result<(), TransportError> {
        if let Err(reason) = write_frame(connection, kind, frame).await {
            self.forget(node_id, connection).await;
            return Err(TransportError::Send {
                address: address.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Dials `node_id` and sends the one frame that asked for the connection. Further frames
    /// for the node are dropped until the dial finishes.
    async fn dial_and_send(self, node_id: NodeId, address: OverlayAddress, frame: Bytes) {
        if !self.dialing.lock().await.insert(node_id) {
            trace!("Dropped packet for {} while dialing", address.short());
            return;
        }
        let sent = async {
            let connection = self.connection_to(node_id, &address).await?;
            self.send_on(node_id, &address, &connection, MessageKind::Data, frame)
                .await
        }
        .await;
        self.dialing.lock().await.remove(&node_id);
        if let Err(error) = sent {
            debug!("Dropped packet for {}: {}", address.short(), error);
        }
    }
}

fn encode_frame(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.put_u8(kind.flag());
    frame.put_slice(payload);
    frame.freeze()
}

/// Splits a frame into its kind and payload. Empty frames and unknown flags yield [None].
fn decode_frame(mut frame: Bytes) -> Option<(MessageKind, Bytes)> {
    let kind = MessageKind::from_flag(*frame.first()?)?;
    Some((kind, frame.split_off(1)))
}

async fn read_stream(mut recv_stream: RecvStream) -> Option<(MessageKind, Bytes)> {
    let data = recv_stream.read_to_end(MAX_MESSAGE_SIZE).await.ok()?;
    decode_frame(Bytes::from(data))
}

async fn write_frame(
    connection: &Connection,
    kind: MessageKind,
    frame: Bytes,
) -> Result<(), String> {
    let fits_datagram = connection
        .max_datagram_size()
        .is_some_and(|limit| frame.len() <= limit);
    if kind == MessageKind::Data && fits_datagram {
        return connection.send_datagram(frame).map_err(|e| e.to_string());
    }
    let mut send_stream = connection.open_uni().await.map_err(|e| e.to_string())?;
    send_stream
        .write_all(&frame)
        .await
        .map_err(|e| e.to_string())?;
    // Dropping the stream finishes it without waiting for the peer.
    Ok(())
}

impl Transport for IrohOverlay {
    async fn send(
        &self,
        destination: &OverlayAddress,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if payload.len() + 1 > MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge(payload.len()));
        }
        let node_id: NodeId = destination
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(destination.clone()))?;
        let frame = encode_frame(kind, &payload);
        if kind == MessageKind::Data {
            let Some(connection) = self.links.cached(node_id).await else {
                let links = self.links.clone();
                tokio::spawn(links.dial_and_send(node_id, destination.clone(), frame));
                return Ok(());
            };
            return self
                .links
                .send_on(node_id, destination, &connection, kind, frame)
                .await;
        }
        let connection = self.links.connection_to(node_id, destination).await?;
        self.links
            .send_on(node_id, destination, &connection, kind, frame)
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        info!("Closing overlay endpoint");
        self.links.shutdown.trigger();
        self.links.connections.lock().await.clear();
        self.links
            .magic_endpoint
            .clone()
            .close(VarInt::from_u32(0), b"shutdown")
            .await
            .map_err(|error| TransportError::Close(format!("{error:#}")))
    }
}

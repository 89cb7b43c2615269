//! # nghost: VPN over an overlay network
//!
//! **nghost** tunnels IPv4 traffic between nodes that have no public address and no port
//! forwarding. Instead of direct IP connectivity it uses a decentralized overlay network
//! (Iroh's relay-assisted QUIC endpoints) as its only transport, and gives every participant
//! an address on a shared virtual subnet.
//!
//! ## Key Features
//!
//! - **Overlay Transport**: Peers are addressed by opaque overlay identities. Messages are
//!   delivered authenticated and encrypted by the overlay, whether or not a direct path exists.
//! - **Peer Discovery**: Nodes periodically announce their virtual address and capabilities.
//!   Announcements populate a peer registry and a route table.
//! - **TUN Device Integration**: Captured packets are classified and either tunneled to the
//!   owning peer, sent to an exit node, or left to the operating system.
//! - **Exit Nodes**: Any participant can bridge the virtual subnet to the public Internet
//!   using OS forwarding and NAT.
//!
//! ## How It Works
//! 1. **Connect**: The node binds an overlay endpoint and waits a bounded time for it to reach
//!    the overlay.
//! 2. **Announce**: It advertises its virtual address (and exit capability) to a discovery
//!    address and to every peer it knows.
//! 3. **Forward**: Every packet read from the TUN device goes to the peer that owns the
//!    destination, or to the first available exit node for off-subnet destinations.
//!
//! ## Warning
//!
//! This does **not** give you anonymity. The exit node sees your Internet traffic.

pub mod config;
pub mod daemon;

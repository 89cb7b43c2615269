//! Minimal IPv4 header access. Checksums and fragmentation are not handled.

use std::net::Ipv4Addr;

/// Length of an IPv4 header without options. Anything shorter is not a packet.
pub const MIN_IPV4_HEADER_LEN: usize = 20;

/// Largest packet read from or written to the interface.
pub const MAX_PACKET_SIZE: usize = 65_536;

const SOURCE_OFFSET: usize = 12;
const DESTINATION_OFFSET: usize = 16;

/// Returns the IP version nibble of the first header byte.
pub fn version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|byte| byte >> 4)
}

/// Returns the destination address of an IPv4 packet, or [None] if the packet is too short or
/// not IPv4.
pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    address_at(packet, DESTINATION_OFFSET)
}

pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
    address_at(packet, SOURCE_OFFSET)
}

fn address_at(packet: &[u8], offset: usize) -> Option<Ipv4Addr> {
    if packet.len() < MIN_IPV4_HEADER_LEN || version(packet) != Some(4) {
        return None;
    }
    let octets: [u8; 4] = packet[offset..offset + 4].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Builds a 60 byte ICMP packet with a bare IPv4 header. Used for synthetic traffic.
pub fn build_test_packet(source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; 60];
    packet[0] = 0x45; // version 4, 5 word header
    packet[2..4].copy_from_slice(&60u16.to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 0x01; // icmp
    packet[SOURCE_OFFSET..SOURCE_OFFSET + 4].copy_from_slice(&source.octets());
    packet[DESTINATION_OFFSET..DESTINATION_OFFSET + 4].copy_from_slice(&destination.octets());
    packet
}

//! Route table mapping virtual subnet prefixes to overlay addresses.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{PoisonError, RwLock},
};

use ipnet::Ipv4Net;
use tracing::debug;

use super::overlay::OverlayAddress;

/// Routes guarded by one reader/writer lock. The table grows with the number of peers, not
/// with packet volume.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<Ipv4Net, OverlayAddress>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `prefix` to `address`, replacing any previous route for the same prefix.
    pub fn add(&self, prefix: Ipv4Net, address: OverlayAddress) {
        let prefix = prefix.trunc();
        debug!("Added route: {} -> {}", prefix, address.short());
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix, address);
    }

    /// Routes the single host `ip` to `address`.
    pub fn add_host(&self, ip: Ipv4Addr, address: OverlayAddress) {
        self.add(Ipv4Net::from(ip), address);
    }

    pub fn remove(&self, prefix: &Ipv4Net) -> Option<OverlayAddress> {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&prefix.trunc());
        if removed.is_some() {
            debug!("Removed route: {}", prefix);
        }
        removed
    }

    pub fn remove_host(&self, ip: Ipv4Addr) -> Option<OverlayAddress> {
        self.remove(&Ipv4Net::from(ip))
    }

    /// Finds the route for `ip`. When several prefixes contain it, the longest one wins.
    pub fn find(&self, ip: Ipv4Addr) -> Option<OverlayAddress> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(prefix, _)| prefix.contains(&ip))
            .max_by_key(|(prefix, _)| prefix.prefix_len())
            .map(|(_, address)| address.clone())
    }

    /// A copy of every route, sorted by prefix.
    pub fn snapshot(&self) -> Vec<(Ipv4Net, OverlayAddress)> {
        let mut routes: Vec<_> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(prefix, address)| (*prefix, address.clone()))
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(prefix: &str) -> Ipv4Net {
        prefix.parse().unwrap()
    }

    #[test]
    fn added_prefix_is_found() {
        let table = RouteTable::new();
        table.add(net("10.100.0.5/32"), OverlayAddress::from("a"));
        table.add(net("10.100.2.0/24"), OverlayAddress::from("b"));

        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 0, 5)),
            Some(OverlayAddress::from("a"))
        );
        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 2, 77)),
            Some(OverlayAddress::from("b"))
        );
        assert_eq!(table.find(Ipv4Addr::new(10, 100, 0, 6)), None);
    }

    #[test]
    fn removed_prefix_is_gone() {
        let table = RouteTable::new();
        table.add(net("10.100.2.0/24"), OverlayAddress::from("b"));

        assert_eq!(
            table.remove(&net("10.100.2.0/24")),
            Some(OverlayAddress::from("b"))
        );
        assert_eq!(table.find(Ipv4Addr::new(10, 100, 2, 77)), None);
        assert_eq!(table.remove(&net("10.100.2.0/24")), None);
    }

    #[test]
    fn re_adding_overwrites() {
        let table = RouteTable::new();
        table.add_host(Ipv4Addr::new(10, 100, 0, 5), OverlayAddress::from("old"));
        table.add(net("10.100.0.5/32"), OverlayAddress::from("new"));

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 0, 5)),
            Some(OverlayAddress::from("new"))
        );
    }

    #[test]
    fn host_bits_are_ignored_in_keys() {
        let table = RouteTable::new();
        table.add(net("10.100.2.9/24"), OverlayAddress::from("b"));

        assert_eq!(table.snapshot(), vec![(net("10.100.2.0/24"), OverlayAddress::from("b"))]);
        assert!(table.remove(&net("10.100.2.0/24")).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new();
        table.add(net("10.100.0.0/16"), OverlayAddress::from("subnet"));
        table.add_host(Ipv4Addr::new(10, 100, 0, 5), OverlayAddress::from("host"));
        table.add(net("10.100.0.0/24"), OverlayAddress::from("middle"));

        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 0, 5)),
            Some(OverlayAddress::from("host"))
        );
        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 0, 6)),
            Some(OverlayAddress::from("middle"))
        );
        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 9, 9)),
            Some(OverlayAddress::from("subnet"))
        );

        table.remove_host(Ipv4Addr::new(10, 100, 0, 5));
        assert_eq!(
            table.find(Ipv4Addr::new(10, 100, 0, 5)),
            Some(OverlayAddress::from("middle"))
        );
    }
}

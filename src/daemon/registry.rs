//! The peer registry: every remote endpoint this node has heard of.
//!
//! Records are kept in insertion order, so "first" in a snapshot means "first seen". Records
//! are never removed. Peers that stop talking are only marked offline.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::overlay::OverlayAddress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub address: OverlayAddress,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(rename = "ipAddress")]
    pub virtual_ip: Option<Ipv4Addr>,
    #[serde(rename = "exitNode")]
    pub is_exit_node: bool,
    /// Round trip time in milliseconds.
    pub latency: Option<u64>,
}

impl PeerRecord {
    fn new(address: OverlayAddress) -> Self {
        Self {
            address,
            online: false,
            last_seen: None,
            virtual_ip: None,
            is_exit_node: false,
            latency: None,
        }
    }
}

/// Attributes a peer announces about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAttributes {
    pub virtual_ip: Option<Ipv4Addr>,
    pub is_exit_node: bool,
}

#[derive(Default)]
struct Records {
    ordered: Vec<PeerRecord>,
    index: HashMap<OverlayAddress, usize>,
}

impl Records {
    fn get_mut(&mut self, address: &OverlayAddress) -> Option<&mut PeerRecord> {
        let position = *self.index.get(address)?;
        self.ordered.get_mut(position)
    }

    fn insert(&mut self, record: PeerRecord) {
        self.index.insert(record.address.clone(), self.ordered.len());
        self.ordered.push(record);
    }
}

/// Thread-safe table of known peers, keyed by overlay address.
#[derive(Default)]
pub struct PeerRegistry {
    records: RwLock<Records>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an announcement from `address`, creating its record if needed.
    ///
    /// Returns `true` if the peer was not known before.
    pub fn upsert(&self, address: &OverlayAddress, attributes: PeerAttributes) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let created = !records.index.contains_key(address);
        if created {
            records.insert(PeerRecord::new(address.clone()));
        }
        let Some(record) = records.get_mut(address) else {
            return created;
        };
        record.virtual_ip = attributes.virtual_ip;
        record.is_exit_node = attributes.is_exit_node;
        record.online = true;
        record.last_seen = Some(Utc::now());
        if created {
            info!("New peer discovered: {}", address.short());
        }
        created
    }

    /// Marks a known peer as alive. Unknown peers are ignored.
    ///
    /// Returns whether the peer was known.
    pub fn touch(&self, address: &OverlayAddress) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(address) {
            Some(record) => {
                record.online = true;
                record.last_seen = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Adds an operator-supplied peer as an offline placeholder.
    ///
    /// A peer that is already known keeps its record. Returns `true` if a placeholder was
    /// created.
    pub fn add_manual(&self, address: &OverlayAddress) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.index.contains_key(address) {
            return false;
        }
        records.insert(PeerRecord::new(address.clone()));
        info!("Added peer manually: {}", address.short());
        true
    }

    /// Marks peers that have been silent for longer than `max_age` as offline.
    ///
    /// Returns how many peers went offline.
    pub fn mark_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for record in records.ordered.iter_mut().filter(|record| record.online) {
            let silent = record
                .last_seen
                .map_or(true, |last_seen| now - last_seen > max_age);
            if silent {
                record.online = false;
                count += 1;
            }
        }
        if count > 0 {
            debug!("Marked {} peers offline", count);
        }
        count
    }

    pub fn get(&self, address: &OverlayAddress) -> Option<PeerRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let position = *records.index.get(address)?;
        records.ordered.get(position).cloned()
    }

    /// A copy of every record, in the order peers were first seen.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .clone()
    }

    pub fn addresses(&self) -> Vec<OverlayAddress> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .iter()
            .map(|record| record.address.clone())
            .collect()
    }

    /// Peers that are both exit nodes and online, in the order they were first seen.
    pub fn find_exit_nodes(&self) -> Vec<PeerRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .iter()
            .filter(|record| record.is_exit_node && record.online)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Exit node selection strategies.

use std::collections::HashSet;

use super::{overlay::OverlayAddress, registry::PeerRecord};

/// Chooses which exit node carries off-subnet traffic.
///
/// `candidates` are the online exit nodes in the order they were first seen.
pub trait ExitSelector: Send + Sync {
    fn select(&self, candidates: &[PeerRecord]) -> Option<OverlayAddress>;
}

/// Picks the first available exit node. No load or latency awareness.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl ExitSelector for FirstAvailable {
    fn select(&self, candidates: &[PeerRecord]) -> Option<OverlayAddress> {
        candidates.first().map(|record| record.address.clone())
    }
}

/// Picks the first available exit node that is on a static allow-list.
#[derive(Debug, Clone)]
pub struct AllowListed {
    allowed: HashSet<OverlayAddress>,
}

impl AllowListed {
    pub fn new(allowed: impl IntoIterator<Item = OverlayAddress>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl ExitSelector for AllowListed {
    fn select(&self, candidates: &[PeerRecord]) -> Option<OverlayAddress> {
        candidates
            .iter()
            .find(|record| self.allowed.contains(&record.address))
            .map(|record| record.address.clone())
    }
}

/// [AllowListed] for a non-empty list, [FirstAvailable] otherwise.
pub fn from_allow_list(allowed: &[String]) -> Box<dyn ExitSelector> {
    if allowed.is_empty() {
        Box::new(FirstAvailable)
    } else {
        Box::new(AllowListed::new(
            allowed.iter().map(|address| OverlayAddress::new(address.as_str())),
        ))
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! MAC learning table.
//!
//! Keyed by (source MAC, VLAN), valued by the bundle the address was seen
//! on. Every entry carries a deterministic revalidation tag: facets whose
//! translation consulted the entry carry the same tag, so moving the
//! address to another bundle revalidates exactly those facets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use openflow::Tag;
use tracing::debug;

use flow::{EthAddr, hash_words, map_hasher};

/// Idle time before a learned entry is forgotten.
pub const MAC_ENTRY_IDLE: Duration = Duration::from_secs(300);
/// How long a gratuitous ARP pins an entry against relearning.
pub const GRAT_ARP_LOCK: Duration = Duration::from_secs(5);
const MAX_ENTRIES: usize = 2048;

#[derive(Clone, Debug)]
pub struct MacEntry {
    pub mac: EthAddr,
    pub vlan: u16,
    /// Bundle the address was learned on.
    pub bundle: String,
    pub expires: Instant,
    grat_arp_lock: Option<Instant>,
}

impl MacEntry {
    #[must_use]
    pub fn is_grat_arp_locked(&self, now: Instant) -> bool {
        self.grat_arp_lock.is_some_and(|until| now < until)
    }

    pub fn set_grat_arp_lock(&mut self, now: Instant) {
        self.grat_arp_lock = Some(now + GRAT_ARP_LOCK);
    }
}

pub struct MacLearning {
    table: HashMap<(EthAddr, u16), MacEntry, ahash::RandomState>,
    basis: u32,
}

impl MacLearning {
    #[must_use]
    pub fn new(basis: u32) -> MacLearning {
        MacLearning {
            table: HashMap::with_hasher(map_hasher()),
            basis,
        }
    }

    /// The revalidation tag of the (mac, vlan) slot, whether or not an entry
    /// exists yet. Lookup misses are tagged too, so a later learn
    /// revalidates the facets that flooded.
    #[must_use]
    pub fn tag_for(&self, mac: EthAddr, vlan: u16) -> Tag {
        let words = [
            u32::from_be_bytes([mac.0[0], mac.0[1], mac.0[2], mac.0[3]]),
            u32::from(u16::from_be_bytes([mac.0[4], mac.0[5]])) << 16 | u32::from(vlan),
        ];
        Tag::deterministic(hash_words(&words, self.basis))
    }

    #[must_use]
    pub fn lookup(&self, mac: EthAddr, vlan: u16, now: Instant) -> Option<&MacEntry> {
        self.table
            .get(&(mac, vlan))
            .filter(|e| e.expires > now)
    }

    pub fn entry_mut(&mut self, mac: EthAddr, vlan: u16) -> Option<&mut MacEntry> {
        self.table.get_mut(&(mac, vlan))
    }

    /// Learn or refresh. Returns the slot's tag when the entry is new or
    /// moved bundles — the caller feeds it into the revalidation set.
    pub fn learn(
        &mut self,
        mac: EthAddr,
        vlan: u16,
        bundle: &str,
        now: Instant,
    ) -> Option<Tag> {
        if mac.is_multicast() {
            return None;
        }
        if self.table.len() >= MAX_ENTRIES && !self.table.contains_key(&(mac, vlan)) {
            self.sweep(now);
            if self.table.len() >= MAX_ENTRIES {
                return None;
            }
        }
        let tag = self.tag_for(mac, vlan);
        match self.table.get_mut(&(mac, vlan)) {
            Some(entry) => {
                entry.expires = now + MAC_ENTRY_IDLE;
                if entry.bundle != bundle {
                    debug!("{mac} on vlan {vlan} moved to bundle {bundle}");
                    entry.bundle = bundle.to_string();
                    entry.grat_arp_lock = None;
                    Some(tag)
                } else {
                    None
                }
            }
            None => {
                debug!("learned {mac} on vlan {vlan} at bundle {bundle}");
                self.table.insert(
                    (mac, vlan),
                    MacEntry {
                        mac,
                        vlan,
                        bundle: bundle.to_string(),
                        expires: now + MAC_ENTRY_IDLE,
                        grat_arp_lock: None,
                    },
                );
                Some(tag)
            }
        }
    }

    /// Drop expired entries. Returns the tags of everything dropped.
    pub fn sweep(&mut self, now: Instant) -> Vec<Tag> {
        let expired: Vec<(EthAddr, u16)> = self
            .table
            .values()
            .filter(|e| e.expires <= now)
            .map(|e| (e.mac, e.vlan))
            .collect();
        let mut tags = Vec::with_capacity(expired.len());
        for key in expired {
            tags.push(self.tag_for(key.0, key.1));
            self.table.remove(&key);
        }
        tags
    }

    /// Forget everything. Returns true if anything was dropped.
    pub fn flush(&mut self) -> bool {
        let had = !self.table.is_empty();
        self.table.clear();
        had
    }

    pub fn entries(&self) -> impl Iterator<Item = &MacEntry> {
        self.table.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: EthAddr = EthAddr([0xaa, 0, 0, 0, 0, 1]);

    #[test]
    fn learn_then_lookup() {
        let now = Instant::now();
        let mut ml = MacLearning::new(1);
        assert!(ml.learn(MAC, 10, "b0", now).is_some());
        // Refresh on same bundle: no revalidation needed.
        assert!(ml.learn(MAC, 10, "b0", now).is_none());
        assert_eq!(ml.lookup(MAC, 10, now).map(|e| e.bundle.as_str()), Some("b0"));
        assert!(ml.lookup(MAC, 20, now).is_none());
    }

    #[test]
    fn move_returns_tag() {
        let now = Instant::now();
        let mut ml = MacLearning::new(1);
        ml.learn(MAC, 10, "b0", now);
        let tag = ml.learn(MAC, 10, "b1", now);
        assert_eq!(tag, Some(ml.tag_for(MAC, 10)));
    }

    #[test]
    fn entries_expire() {
        let now = Instant::now();
        let mut ml = MacLearning::new(1);
        ml.learn(MAC, 10, "b0", now);
        let later = now + MAC_ENTRY_IDLE + Duration::from_secs(1);
        assert!(ml.lookup(MAC, 10, later).is_none());
        assert_eq!(ml.sweep(later).len(), 1);
        assert!(ml.is_empty());
    }

    #[test]
    fn multicast_never_learned() {
        let now = Instant::now();
        let mut ml = MacLearning::new(1);
        assert!(ml.learn(EthAddr::BROADCAST, 10, "b0", now).is_none());
        assert!(ml.is_empty());
    }

    #[test]
    fn grat_arp_lock_window() {
        let now = Instant::now();
        let mut ml = MacLearning::new(1);
        ml.learn(MAC, 10, "b0", now);
        let e = ml.entry_mut(MAC, 10).unwrap();
        e.set_grat_arp_lock(now);
        assert!(e.is_grat_arp_locked(now + Duration::from_secs(4)));
        assert!(!e.is_grat_arp_locked(now + Duration::from_secs(6)));
    }
}

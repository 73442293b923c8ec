// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port mirroring.
//!
//! Mirrors get dense indexes in `[0, MAX_MIRRORS)` so a set of them fits in
//! one word; bundles carry the masks of the mirrors selecting on them, and
//! translation ORs those together to decide what to mirror.

use crate::bundle::VlanSet;

/// Upper bound on mirrors per bridge; mirror sets are one `u32`.
pub const MAX_MIRRORS: usize = 32;

/// A set of mirror indexes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct MirrorMask(pub u32);

impl MirrorMask {
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, idx: usize) -> bool {
        self.0 & (1 << idx) != 0
    }

    pub fn insert(&mut self, idx: usize) {
        self.0 |= 1 << idx;
    }

    pub fn remove_all(&mut self, other: MirrorMask) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub fn union(self, other: MirrorMask) -> MirrorMask {
        MirrorMask(self.0 | other.0)
    }

    /// Lowest set index, if any.
    #[must_use]
    pub fn first(self) -> Option<usize> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_MIRRORS).filter(move |i| self.contains(*i))
    }
}

/// Mirror configuration input.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub name: String,
    /// Mirror packets received on these bundles.
    pub select_src: Vec<String>,
    /// Mirror packets sent to these bundles.
    pub select_dst: Vec<String>,
    /// Restrict to these VLANs; `None` selects all.
    pub select_vlans: Option<VlanSet>,
    /// Select every packet regardless of bundle.
    pub select_all: bool,
    /// Output: either a bundle...
    pub out_bundle: Option<String>,
    /// ...or flood on a VLAN.
    pub out_vlan: Option<u16>,
}

/// A configured mirror.
#[derive(Clone, Debug)]
pub struct Mirror {
    pub name: String,
    pub idx: usize,
    pub vlan_filter: Option<VlanSet>,
    pub out_bundle: Option<String>,
    pub out_vlan: Option<u16>,
    /// Mirrors (this one included) with the same output; translation emits
    /// one copy and credits them all.
    pub dup_mirrors: MirrorMask,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// Recompute every mirror's duplicate set after configuration changes.
pub fn update_dup_mirrors(mirrors: &mut [Option<Mirror>; MAX_MIRRORS]) {
    let outputs: Vec<Option<(Option<String>, Option<u16>)>> = mirrors
        .iter()
        .map(|m| m.as_ref().map(|m| (m.out_bundle.clone(), m.out_vlan)))
        .collect();
    for i in 0..MAX_MIRRORS {
        let Some(out_i) = &outputs[i] else { continue };
        let mut dups = MirrorMask::default();
        for (j, out_j) in outputs.iter().enumerate() {
            if out_j.as_ref() == Some(out_i) {
                dups.insert(j);
            }
        }
        if let Some(m) = mirrors[i].as_mut() {
            m.dup_mirrors = dups;
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port bundles: VLAN admission and tagging, bonding.

use flow::{EthAddr, Flow, OfPort, VLAN_CFI, VLAN_PCP_MASK, VLAN_VID_MASK, hash_words};

use crate::mirror::MirrorMask;

/// A 4096-bit VLAN membership set.
#[derive(Clone, PartialEq, Eq)]
pub struct VlanSet([u64; 64]);

impl VlanSet {
    #[must_use]
    pub fn empty() -> VlanSet {
        VlanSet([0; 64])
    }

    #[must_use]
    pub fn full() -> VlanSet {
        VlanSet([u64::MAX; 64])
    }

    pub fn insert(&mut self, vid: u16) {
        let vid = usize::from(vid & 0x0fff);
        self.0[vid / 64] |= 1 << (vid % 64);
    }

    #[must_use]
    pub fn contains(&self, vid: u16) -> bool {
        let vid = usize::from(vid & 0x0fff);
        self.0[vid / 64] & (1 << (vid % 64)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0u16..4096).filter(|v| self.contains(*v))
    }
}

impl FromIterator<u16> for VlanSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> VlanSet {
        let mut set = VlanSet::empty();
        for vid in iter {
            set.insert(vid);
        }
        set
    }
}

impl std::fmt::Debug for VlanSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// How a bundle treats 802.1Q tags.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VlanMode {
    Access,
    Trunk,
    NativeUntagged,
    NativeTagged,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BondMode {
    ActiveBackup,
    Slb,
    BalanceTcp,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BondConfig {
    pub mode: BondMode,
    pub basis: u16,
}

/// Bundle configuration input.
#[derive(Clone, Debug)]
pub struct BundleConfig {
    pub name: String,
    /// Member port names; more than one makes the bundle bonded.
    pub slaves: Vec<String>,
    pub vlan_mode: VlanMode,
    /// Access / native VLAN. Ignored in `Trunk` mode.
    pub vlan: u16,
    /// Trunked VLANs; `None` means all 4096.
    pub trunks: Option<VlanSet>,
    pub use_priority_tags: bool,
    pub bond: Option<BondConfig>,
    pub lacp: bool,
}

/// A configured bundle.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub name: String,
    pub ports: Vec<OfPort>,
    pub vlan_mode: VlanMode,
    pub vlan: u16,
    pub trunks: Option<VlanSet>,
    pub use_priority_tags: bool,
    pub bond: Option<BondConfig>,
    pub lacp: bool,
    /// Mirrors selecting on this bundle as a source / destination, and
    /// mirrors outputting to it.
    pub src_mirrors: MirrorMask,
    pub dst_mirrors: MirrorMask,
    pub mirror_out: MirrorMask,
}

impl Bundle {
    #[must_use]
    pub fn is_bonded(&self) -> bool {
        self.ports.len() > 1
    }

    fn trunks_contain(&self, vid: u16) -> bool {
        match &self.trunks {
            Some(set) => set.contains(vid),
            None => true,
        }
    }

    /// VLAN id admitted at ingress for a frame with this TCI, or `None` to
    /// drop the frame.
    #[must_use]
    pub fn input_vid(&self, vlan_tci: u16) -> Option<u16> {
        let vid = if vlan_tci & VLAN_CFI != 0 {
            vlan_tci & VLAN_VID_MASK
        } else {
            0
        };
        match self.vlan_mode {
            VlanMode::Access => (vid == 0).then_some(0),
            VlanMode::Trunk => self.trunks_contain(vid).then_some(vid),
            VlanMode::NativeUntagged | VlanMode::NativeTagged => {
                if vid == 0 {
                    Some(0)
                } else {
                    self.trunks_contain(vid).then_some(vid)
                }
            }
        }
    }

    /// Map an admitted ingress VID to the logical VLAN.
    #[must_use]
    pub fn input_vid_to_vlan(&self, vid: u16) -> u16 {
        match self.vlan_mode {
            VlanMode::Access => self.vlan,
            VlanMode::Trunk => vid,
            VlanMode::NativeUntagged | VlanMode::NativeTagged => {
                if vid == 0 {
                    self.vlan
                } else {
                    vid
                }
            }
        }
    }

    /// Does this bundle carry `vlan` at all?
    #[must_use]
    pub fn includes_vlan(&self, vlan: u16) -> bool {
        match self.vlan_mode {
            VlanMode::Access => vlan == self.vlan,
            VlanMode::Trunk => self.trunks_contain(vlan),
            VlanMode::NativeUntagged | VlanMode::NativeTagged => {
                vlan == self.vlan || self.trunks_contain(vlan)
            }
        }
    }

    /// The VID to tag an egress frame with for logical `vlan`: `Some(0)`
    /// means send untagged, `None` means the bundle is not a member.
    #[must_use]
    pub fn output_vlan_to_vid(&self, vlan: u16) -> Option<u16> {
        match self.vlan_mode {
            VlanMode::Access => (vlan == self.vlan).then_some(0),
            VlanMode::Trunk => self.trunks_contain(vlan).then_some(vlan),
            VlanMode::NativeUntagged => {
                if vlan == self.vlan {
                    Some(0)
                } else {
                    self.trunks_contain(vlan).then_some(vlan)
                }
            }
            VlanMode::NativeTagged => {
                if vlan == self.vlan {
                    Some(vlan)
                } else {
                    self.trunks_contain(vlan).then_some(vlan)
                }
            }
        }
    }

    /// Egress TCI for `vid`, preserving priority bits when configured.
    #[must_use]
    pub fn output_tci(&self, vid: u16, ingress_tci: u16) -> u16 {
        let mut tci = vid;
        if self.use_priority_tags {
            tci |= ingress_tci & VLAN_PCP_MASK;
        }
        if tci != 0 {
            tci |= VLAN_CFI;
        }
        tci
    }

    /// Pick the bond slave for a flow. Deterministic in (flow, vlan, basis).
    #[must_use]
    pub fn bond_choose_output(&self, dl_src: EthAddr, flow: &Flow, vlan: u16) -> Option<OfPort> {
        if self.ports.is_empty() {
            return None;
        }
        if !self.is_bonded() {
            return Some(self.ports[0]);
        }
        let basis = self.bond.map_or(0, |b| u32::from(b.basis));
        let hash = match self.bond.map(|b| b.mode) {
            Some(BondMode::BalanceTcp) => {
                let words = [
                    u32::from_be_bytes([dl_src.0[0], dl_src.0[1], dl_src.0[2], dl_src.0[3]]),
                    u32::from(flow.dl_type) << 16 | u32::from(vlan),
                    u32::from(flow.nw_src),
                    u32::from(flow.nw_dst),
                    u32::from(flow.tp_src) << 16 | u32::from(flow.tp_dst),
                ];
                hash_words(&words, basis)
            }
            _ => {
                // Source-MAC hashing (SLB and the active-backup fallback).
                let words = [
                    u32::from_be_bytes([dl_src.0[0], dl_src.0[1], dl_src.0[2], dl_src.0[3]]),
                    u32::from(u16::from_be_bytes([dl_src.0[4], dl_src.0[5]])) << 16
                        | u32::from(vlan),
                ];
                hash_words(&words, basis)
            }
        };
        Some(self.ports[hash as usize % self.ports.len()])
    }

    /// The bond slave that owns broadcast/multicast for this bundle.
    #[must_use]
    pub fn bond_active_slave(&self) -> Option<OfPort> {
        self.ports.first().copied()
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;

/// Number of general-purpose registers carried by a flow.
pub const FLOW_N_REGS: usize = 8;

/// Depth of the MPLS label stack a flow can represent.
pub const FLOW_MAX_MPLS_LABELS: usize = 2;

/// Number of 32-bit words in the canonical word form of a [`Flow`].
pub const FLOW_WORDS: usize = 44;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_MPLS: u16 = 0x8847;
pub const ETH_TYPE_MPLS_MCAST: u16 = 0x8848;
/// IEEE 802.3ad "slow protocols" ethertype (LACP lives here).
pub const ETH_TYPE_SLOW: u16 = 0x8809;
/// Synthetic `dl_type` for frames with no recognizable ethertype
/// (802.2 LLC frames whose length field is below 0x600).
pub const DL_TYPE_NONE: u16 = 0x05ff;

pub const VLAN_VID_MASK: u16 = 0x0fff;
pub const VLAN_PCP_MASK: u16 = 0xe000;
pub const VLAN_PCP_SHIFT: u16 = 13;
/// Set in `vlan_tci` whenever an 802.1Q header is present; a TCI of zero
/// therefore always means "no VLAN tag at all".
pub const VLAN_CFI: u16 = 0x1000;

pub const MPLS_LABEL_SHIFT: u32 = 12;
pub const MPLS_BOS_MASK: u32 = 0x0000_0100;
pub const MPLS_TTL_MASK: u32 = 0x0000_00ff;

/// An Ethernet address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);
    /// 802.1D spanning tree / bridge group address.
    pub const STP_MULTICAST: EthAddr = EthAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x00]);
    /// Base of the 802.1ag CFM CCM group address range (low nibble is the MD level).
    pub const CFM_MULTICAST_BASE: EthAddr = EthAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x30]);
    /// Slow-protocols (LACP) destination address.
    pub const LACP_MULTICAST: EthAddr = EthAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x02]);

    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// True for the 01:80:c2:00:00:3x CCM group address range.
    #[must_use]
    pub fn is_cfm_multicast(&self) -> bool {
        self.0[..5] == Self::CFM_MULTICAST_BASE.0[..5] && self.0[5] & 0xf0 == 0x30
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An OpenFlow port number, including the reserved upper range.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OfPort(pub u16);

impl OfPort {
    /// Highest assignable physical port number.
    pub const MAX: OfPort = OfPort(0xff00);
    /// Send back out the ingress port.
    pub const IN_PORT: OfPort = OfPort(0xfff8);
    /// Submit to the rule table.
    pub const TABLE: OfPort = OfPort(0xfff9);
    /// L2 learning switch processing.
    pub const NORMAL: OfPort = OfPort(0xfffa);
    /// Flood to all eligible ports except ingress.
    pub const FLOOD: OfPort = OfPort(0xfffb);
    /// All ports except ingress.
    pub const ALL: OfPort = OfPort(0xfffc);
    /// Send to the OpenFlow controller.
    pub const CONTROLLER: OfPort = OfPort(0xfffd);
    /// The bridge-local port.
    pub const LOCAL: OfPort = OfPort(0xfffe);
    /// Not a port.
    pub const NONE: OfPort = OfPort(0xffff);
}

impl fmt::Display for OfPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OfPort::IN_PORT => write!(f, "IN_PORT"),
            OfPort::TABLE => write!(f, "TABLE"),
            OfPort::NORMAL => write!(f, "NORMAL"),
            OfPort::FLOOD => write!(f, "FLOOD"),
            OfPort::ALL => write!(f, "ALL"),
            OfPort::CONTROLLER => write!(f, "CONTROLLER"),
            OfPort::LOCAL => write!(f, "LOCAL"),
            OfPort::NONE => write!(f, "NONE"),
            OfPort(n) => write!(f, "{n}"),
        }
    }
}

impl fmt::Debug for OfPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

bitflags! {
    /// IP fragment state of a flow.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
    pub struct FlowFrag: u8 {
        /// The packet is a fragment.
        const ANY = 0x01;
        /// The packet is a fragment with a nonzero offset.
        const LATER = 0x02;
    }
}

bitflags! {
    /// Tunnel header option flags.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
    pub struct TunnelFlags: u16 {
        const DONT_FRAGMENT = 0x01;
        const CSUM = 0x02;
        const KEY = 0x04;
    }
}

/// Tunnel metadata accompanying a flow that arrived on (or is being sent
/// over) a tunnel port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowTunnel {
    pub tun_id: u64,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub flags: TunnelFlags,
    pub ip_tos: u8,
    pub ip_ttl: u8,
}

impl Default for FlowTunnel {
    fn default() -> Self {
        FlowTunnel {
            tun_id: 0,
            ip_src: Ipv4Addr::UNSPECIFIED,
            ip_dst: Ipv4Addr::UNSPECIFIED,
            flags: TunnelFlags::default(),
            ip_tos: 0,
            ip_ttl: 0,
        }
    }
}

impl FlowTunnel {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == FlowTunnel::default()
    }
}

impl Default for Flow {
    fn default() -> Self {
        Flow {
            tunnel: FlowTunnel::default(),
            metadata: 0,
            regs: [0; FLOW_N_REGS],
            skb_priority: 0,
            skb_mark: 0,
            in_port: OfPort(0),
            dl_src: EthAddr::default(),
            dl_dst: EthAddr::default(),
            dl_type: 0,
            vlan_tci: 0,
            mpls_lse: [0; FLOW_MAX_MPLS_LABELS],
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            ipv6_src: Ipv6Addr::UNSPECIFIED,
            ipv6_dst: Ipv6Addr::UNSPECIFIED,
            ipv6_label: 0,
            nw_proto: 0,
            nw_tos: 0,
            nw_ttl: 0,
            nw_frag: FlowFrag::empty(),
            arp_sha: EthAddr::default(),
            arp_tha: EthAddr::default(),
            nd_target: Ipv6Addr::UNSPECIFIED,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

/// The parsed-packet record over the full match space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Flow {
    pub tunnel: FlowTunnel,
    pub metadata: u64,
    pub regs: [u32; FLOW_N_REGS],
    pub skb_priority: u32,
    pub skb_mark: u32,
    pub in_port: OfPort,
    pub dl_src: EthAddr,
    pub dl_dst: EthAddr,
    pub dl_type: u16,
    pub vlan_tci: u16,
    pub mpls_lse: [u32; FLOW_MAX_MPLS_LABELS],
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub ipv6_src: Ipv6Addr,
    pub ipv6_dst: Ipv6Addr,
    pub ipv6_label: u32,
    pub nw_proto: u8,
    pub nw_tos: u8,
    pub nw_ttl: u8,
    pub nw_frag: FlowFrag,
    pub arp_sha: EthAddr,
    pub arp_tha: EthAddr,
    pub nd_target: Ipv6Addr,
    pub tp_src: u16,
    pub tp_dst: u16,
}

// Byte offsets of each field within the canonical word image. The packing is
// arbitrary but fixed; everything that masks, hashes or compacts flows goes
// through it.
mod off {
    pub const TUN_ID: usize = 0; // 8
    pub const TUN_SRC: usize = 8; // 4
    pub const TUN_DST: usize = 12; // 4
    pub const TUN_MISC: usize = 16; // flags:2 tos:1 ttl:1
    pub const METADATA: usize = 20; // 8
    pub const REGS: usize = 28; // 32
    pub const SKB_PRIORITY: usize = 60; // 4
    pub const SKB_MARK: usize = 64; // 4
    pub const IN_PORT: usize = 68; // in_port:2 vlan_tci:2
    pub const DL_SRC: usize = 72; // 6
    pub const DL_DST: usize = 78; // 6
    pub const DL_MISC: usize = 84; // dl_type:2 nw_proto:1 nw_frag:1
    pub const MPLS_LSE: usize = 88; // 8
    pub const NW_SRC: usize = 96; // 4
    pub const NW_DST: usize = 100; // 4
    pub const IPV6_SRC: usize = 104; // 16
    pub const IPV6_DST: usize = 120; // 16
    pub const IPV6_LABEL: usize = 136; // 4
    pub const TP: usize = 140; // tp_src:2 tp_dst:2
    pub const NW_MISC: usize = 144; // tos:1 ttl:1 pad:2
    pub const ARP_SHA: usize = 148; // 6
    pub const ARP_THA: usize = 154; // 6
    pub const ND_TARGET: usize = 160; // 16
    pub const END: usize = 176;
}

const _: () = assert!(off::END == FLOW_WORDS * 4);

impl Flow {
    /// Canonical word image of the flow.
    #[must_use]
    pub fn to_words(&self) -> [u32; FLOW_WORDS] {
        let mut b = [0u8; FLOW_WORDS * 4];
        b[off::TUN_ID..off::TUN_ID + 8].copy_from_slice(&self.tunnel.tun_id.to_be_bytes());
        b[off::TUN_SRC..off::TUN_SRC + 4].copy_from_slice(&self.tunnel.ip_src.octets());
        b[off::TUN_DST..off::TUN_DST + 4].copy_from_slice(&self.tunnel.ip_dst.octets());
        b[off::TUN_MISC..off::TUN_MISC + 2]
            .copy_from_slice(&self.tunnel.flags.bits().to_be_bytes());
        b[off::TUN_MISC + 2] = self.tunnel.ip_tos;
        b[off::TUN_MISC + 3] = self.tunnel.ip_ttl;
        b[off::METADATA..off::METADATA + 8].copy_from_slice(&self.metadata.to_be_bytes());
        for (i, reg) in self.regs.iter().enumerate() {
            let at = off::REGS + i * 4;
            b[at..at + 4].copy_from_slice(&reg.to_be_bytes());
        }
        b[off::SKB_PRIORITY..off::SKB_PRIORITY + 4]
            .copy_from_slice(&self.skb_priority.to_be_bytes());
        b[off::SKB_MARK..off::SKB_MARK + 4].copy_from_slice(&self.skb_mark.to_be_bytes());
        b[off::IN_PORT..off::IN_PORT + 2].copy_from_slice(&self.in_port.0.to_be_bytes());
        b[off::IN_PORT + 2..off::IN_PORT + 4].copy_from_slice(&self.vlan_tci.to_be_bytes());
        b[off::DL_SRC..off::DL_SRC + 6].copy_from_slice(&self.dl_src.0);
        b[off::DL_DST..off::DL_DST + 6].copy_from_slice(&self.dl_dst.0);
        b[off::DL_MISC..off::DL_MISC + 2].copy_from_slice(&self.dl_type.to_be_bytes());
        b[off::DL_MISC + 2] = self.nw_proto;
        b[off::DL_MISC + 3] = self.nw_frag.bits();
        for (i, lse) in self.mpls_lse.iter().enumerate() {
            let at = off::MPLS_LSE + i * 4;
            b[at..at + 4].copy_from_slice(&lse.to_be_bytes());
        }
        b[off::NW_SRC..off::NW_SRC + 4].copy_from_slice(&self.nw_src.octets());
        b[off::NW_DST..off::NW_DST + 4].copy_from_slice(&self.nw_dst.octets());
        b[off::IPV6_SRC..off::IPV6_SRC + 16].copy_from_slice(&self.ipv6_src.octets());
        b[off::IPV6_DST..off::IPV6_DST + 16].copy_from_slice(&self.ipv6_dst.octets());
        b[off::IPV6_LABEL..off::IPV6_LABEL + 4].copy_from_slice(&self.ipv6_label.to_be_bytes());
        b[off::TP..off::TP + 2].copy_from_slice(&self.tp_src.to_be_bytes());
        b[off::TP + 2..off::TP + 4].copy_from_slice(&self.tp_dst.to_be_bytes());
        b[off::NW_MISC] = self.nw_tos;
        b[off::NW_MISC + 1] = self.nw_ttl;
        b[off::ARP_SHA..off::ARP_SHA + 6].copy_from_slice(&self.arp_sha.0);
        b[off::ARP_THA..off::ARP_THA + 6].copy_from_slice(&self.arp_tha.0);
        b[off::ND_TARGET..off::ND_TARGET + 16].copy_from_slice(&self.nd_target.octets());

        let mut words = [0u32; FLOW_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&b[i * 4..i * 4 + 4]);
            *w = u32::from_be_bytes(raw);
        }
        words
    }

    /// Rebuild a flow from its canonical word image.
    ///
    /// Flag fields are reconstructed bit-for-bit (`from_bits_retain`) so that
    /// mask images with all bits set survive the round trip.
    #[must_use]
    pub fn from_words(words: &[u32; FLOW_WORDS]) -> Flow {
        let mut b = [0u8; FLOW_WORDS * 4];
        for (i, w) in words.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
        }
        let take4 = |at: usize| -> [u8; 4] {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&b[at..at + 4]);
            raw
        };
        let take6 = |at: usize| -> [u8; 6] {
            let mut raw = [0u8; 6];
            raw.copy_from_slice(&b[at..at + 6]);
            raw
        };
        let take8 = |at: usize| -> [u8; 8] {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[at..at + 8]);
            raw
        };
        let take16 = |at: usize| -> [u8; 16] {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&b[at..at + 16]);
            raw
        };
        let take2 = |at: usize| -> u16 { u16::from_be_bytes([b[at], b[at + 1]]) };

        let mut regs = [0u32; FLOW_N_REGS];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = u32::from_be_bytes(take4(off::REGS + i * 4));
        }
        let mut mpls_lse = [0u32; FLOW_MAX_MPLS_LABELS];
        for (i, lse) in mpls_lse.iter_mut().enumerate() {
            *lse = u32::from_be_bytes(take4(off::MPLS_LSE + i * 4));
        }
        Flow {
            tunnel: FlowTunnel {
                tun_id: u64::from_be_bytes(take8(off::TUN_ID)),
                ip_src: Ipv4Addr::from(take4(off::TUN_SRC)),
                ip_dst: Ipv4Addr::from(take4(off::TUN_DST)),
                flags: TunnelFlags::from_bits_retain(take2(off::TUN_MISC)),
                ip_tos: b[off::TUN_MISC + 2],
                ip_ttl: b[off::TUN_MISC + 3],
            },
            metadata: u64::from_be_bytes(take8(off::METADATA)),
            regs,
            skb_priority: u32::from_be_bytes(take4(off::SKB_PRIORITY)),
            skb_mark: u32::from_be_bytes(take4(off::SKB_MARK)),
            in_port: OfPort(take2(off::IN_PORT)),
            vlan_tci: take2(off::IN_PORT + 2),
            dl_src: EthAddr(take6(off::DL_SRC)),
            dl_dst: EthAddr(take6(off::DL_DST)),
            dl_type: take2(off::DL_MISC),
            nw_proto: b[off::DL_MISC + 2],
            nw_frag: FlowFrag::from_bits_retain(b[off::DL_MISC + 3]),
            mpls_lse,
            nw_src: Ipv4Addr::from(take4(off::NW_SRC)),
            nw_dst: Ipv4Addr::from(take4(off::NW_DST)),
            ipv6_src: Ipv6Addr::from(take16(off::IPV6_SRC)),
            ipv6_dst: Ipv6Addr::from(take16(off::IPV6_DST)),
            ipv6_label: u32::from_be_bytes(take4(off::IPV6_LABEL)),
            tp_src: take2(off::TP),
            tp_dst: take2(off::TP + 2),
            nw_tos: b[off::NW_MISC],
            nw_ttl: b[off::NW_MISC + 1],
            arp_sha: EthAddr(take6(off::ARP_SHA)),
            arp_tha: EthAddr(take6(off::ARP_THA)),
            nd_target: Ipv6Addr::from(take16(off::ND_TARGET)),
        }
    }

    /// VLAN id carried in `vlan_tci`, 0 when untagged.
    #[must_use]
    pub fn vlan_vid(&self) -> u16 {
        self.vlan_tci & VLAN_VID_MASK
    }

    /// True when the flow is an ARP request or reply whose sender and target
    /// protocol addresses agree, i.e. a gratuitous ARP.
    #[must_use]
    pub fn is_gratuitous_arp(&self) -> bool {
        self.dl_type == ETH_TYPE_ARP
            && (self.nw_proto == 1 || self.nw_proto == 2)
            && self.nw_src == self.nw_dst
            && !self.nw_src.is_unspecified()
    }

    /// Zero the transport ports, used by the `Normal` fragment-handling mode
    /// so all fragments of one datagram look alike to the rule table.
    pub fn zero_transport(&mut self) {
        self.tp_src = 0;
        self.tp_dst = 0;
    }

    #[must_use]
    pub fn is_ip_any(&self) -> bool {
        self.dl_type == ETH_TYPE_IP || self.dl_type == ETH_TYPE_IPV6
    }

    #[must_use]
    pub fn is_icmp_any(&self) -> bool {
        (self.dl_type == ETH_TYPE_IP && self.nw_proto == 1)
            || (self.dl_type == ETH_TYPE_IPV6 && self.nw_proto == 58)
    }

    #[must_use]
    pub fn is_mpls(&self) -> bool {
        self.dl_type == ETH_TYPE_MPLS || self.dl_type == ETH_TYPE_MPLS_MCAST
    }
}

/// Compose a TCI from a VLAN id and priority; the CFI bit is always set so
/// the result is distinguishable from "untagged".
#[must_use]
pub fn vid_pcp_to_tci(vid: u16, pcp: u8) -> u16 {
    (vid & VLAN_VID_MASK) | (u16::from(pcp) << VLAN_PCP_SHIFT) | VLAN_CFI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_roundtrip_default() {
        let f = Flow::default();
        assert_eq!(Flow::from_words(&f.to_words()), f);
    }

    #[test]
    fn word_roundtrip_populated() {
        let f = Flow {
            tunnel: FlowTunnel {
                tun_id: 0x1234_5678_9abc_def0,
                ip_src: Ipv4Addr::new(10, 0, 0, 1),
                ip_dst: Ipv4Addr::new(10, 0, 0, 2),
                flags: TunnelFlags::KEY | TunnelFlags::CSUM,
                ip_tos: 0x2e,
                ip_ttl: 64,
            },
            metadata: 0xdead_beef,
            regs: [1, 2, 3, 4, 5, 6, 7, 8],
            skb_priority: 7,
            skb_mark: 99,
            in_port: OfPort(3),
            dl_src: EthAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            dl_dst: EthAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]),
            dl_type: ETH_TYPE_IP,
            vlan_tci: vid_pcp_to_tci(10, 5),
            mpls_lse: [0, 0],
            nw_src: Ipv4Addr::new(192, 168, 0, 1),
            nw_dst: Ipv4Addr::new(192, 168, 0, 2),
            nw_proto: 6,
            nw_tos: 0,
            nw_ttl: 64,
            nw_frag: FlowFrag::ANY,
            tp_src: 12345,
            tp_dst: 80,
            ..Flow::default()
        };
        assert_eq!(Flow::from_words(&f.to_words()), f);
    }

    #[test]
    fn all_ones_mask_image_survives() {
        let words = [u32::MAX; FLOW_WORDS];
        let f = Flow::from_words(&words);
        assert_eq!(f.to_words(), words);
    }

    #[test]
    fn gratuitous_arp() {
        let mut f = Flow {
            dl_type: ETH_TYPE_ARP,
            nw_proto: 1,
            nw_src: Ipv4Addr::new(10, 0, 0, 1),
            nw_dst: Ipv4Addr::new(10, 0, 0, 1),
            ..Flow::default()
        };
        assert!(f.is_gratuitous_arp());
        f.nw_dst = Ipv4Addr::new(10, 0, 0, 2);
        assert!(!f.is_gratuitous_arp());
    }

    #[test]
    fn special_port_display() {
        assert_eq!(OfPort::NORMAL.to_string(), "NORMAL");
        assert_eq!(OfPort(42).to_string(), "42");
    }
}

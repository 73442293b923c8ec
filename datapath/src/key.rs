// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Netlink-attribute-shaped datapath flow keys.
//!
//! The wire form in a real datapath is a stream of nested TLVs; here each
//! attribute kind is a variant of [`OdpKeyAttr`] carrying its operands by
//! value, and a key is the ordered attribute list. Identity (`Eq`/`Hash`)
//! over the typed form is what the flow tables key on.

use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use flow::{
    DL_TYPE_NONE, ETH_TYPE_IP, ETH_TYPE_IPV6, ETH_TYPE_VLAN, EthAddr, Flow, FlowFrag, TunnelFlags,
};

/// A datapath port number. Distinct from the OpenFlow port space; the port
/// adapter owns the mapping.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OdpPort(pub u32);

impl fmt::Display for OdpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OdpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "odp:{}", self.0)
    }
}

/// Fragment state attribute value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OdpFrag {
    None,
    First,
    Later,
}

impl OdpFrag {
    fn from_flow(frag: FlowFrag) -> OdpFrag {
        if frag.contains(FlowFrag::LATER) {
            OdpFrag::Later
        } else if frag.contains(FlowFrag::ANY) {
            OdpFrag::First
        } else {
            OdpFrag::None
        }
    }

    fn to_flow(self) -> FlowFrag {
        match self {
            OdpFrag::None => FlowFrag::empty(),
            OdpFrag::First => FlowFrag::ANY,
            OdpFrag::Later => FlowFrag::ANY | FlowFrag::LATER,
        }
    }
}

/// One flow-key attribute.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum OdpKeyAttr {
    Priority(u32),
    SkbMark(u32),
    Tunnel {
        id: u64,
        ipv4_src: Ipv4Addr,
        ipv4_dst: Ipv4Addr,
        flags: u16,
        tos: u8,
        ttl: u8,
    },
    InPort(OdpPort),
    Ethernet {
        src: EthAddr,
        dst: EthAddr,
    },
    EtherType(u16),
    /// 802.1Q TCI, CFI bit set. Followed by an [`OdpKeyAttr::Encap`] holding
    /// the attributes of the encapsulated frame.
    Vlan(u16),
    Encap(Vec<OdpKeyAttr>),
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: u8,
        tos: u8,
        ttl: u8,
        frag: OdpFrag,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        label: u32,
        proto: u8,
        tclass: u8,
        hlimit: u8,
        frag: OdpFrag,
    },
    Arp {
        sip: Ipv4Addr,
        tip: Ipv4Addr,
        op: u16,
        sha: EthAddr,
        tha: EthAddr,
    },
    Tcp {
        src: u16,
        dst: u16,
    },
    Udp {
        src: u16,
        dst: u16,
    },
    Icmp {
        ty: u8,
        code: u8,
    },
    Icmpv6 {
        ty: u8,
        code: u8,
    },
    Nd {
        target: Ipv6Addr,
        sll: EthAddr,
        tll: EthAddr,
    },
    Mpls {
        lse: u32,
    },
}

/// A complete datapath flow key: an ordered attribute list.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OdpFlowKey(pub Vec<OdpKeyAttr>);

/// How faithfully a key round-trips through the parsed [`Flow`].
///
/// `TooLittle` keys carry less than the flow needs (e.g. an L3 ethertype with
/// no L3 attributes); installing a facet for one would mean matching packets
/// the translation never saw, so the cache refuses them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OdpFitness {
    Perfect,
    TooLittle,
}

fn l3_onwards(flow: &Flow) -> Vec<OdpKeyAttr> {
    let mut attrs = Vec::new();
    match flow.dl_type {
        ETH_TYPE_IP => {
            attrs.push(OdpKeyAttr::Ipv4 {
                src: flow.nw_src,
                dst: flow.nw_dst,
                proto: flow.nw_proto,
                tos: flow.nw_tos,
                ttl: flow.nw_ttl,
                frag: OdpFrag::from_flow(flow.nw_frag),
            });
        }
        ETH_TYPE_IPV6 => {
            attrs.push(OdpKeyAttr::Ipv6 {
                src: flow.ipv6_src,
                dst: flow.ipv6_dst,
                label: flow.ipv6_label,
                proto: flow.nw_proto,
                tclass: flow.nw_tos,
                hlimit: flow.nw_ttl,
                frag: OdpFrag::from_flow(flow.nw_frag),
            });
        }
        flow::ETH_TYPE_ARP => {
            attrs.push(OdpKeyAttr::Arp {
                sip: flow.nw_src,
                tip: flow.nw_dst,
                op: u16::from(flow.nw_proto),
                sha: flow.arp_sha,
                tha: flow.arp_tha,
            });
            return attrs;
        }
        flow::ETH_TYPE_MPLS | flow::ETH_TYPE_MPLS_MCAST => {
            for &lse in &flow.mpls_lse {
                if lse == 0 {
                    break;
                }
                attrs.push(OdpKeyAttr::Mpls { lse });
            }
            return attrs;
        }
        _ => return attrs,
    }
    if flow.nw_frag.contains(FlowFrag::LATER) {
        return attrs;
    }
    match (flow.dl_type, flow.nw_proto) {
        (_, 6) => attrs.push(OdpKeyAttr::Tcp {
            src: flow.tp_src,
            dst: flow.tp_dst,
        }),
        (_, 17) => attrs.push(OdpKeyAttr::Udp {
            src: flow.tp_src,
            dst: flow.tp_dst,
        }),
        (ETH_TYPE_IP, 1) => attrs.push(OdpKeyAttr::Icmp {
            ty: flow.tp_src as u8,
            code: flow.tp_dst as u8,
        }),
        (ETH_TYPE_IPV6, 58) => {
            attrs.push(OdpKeyAttr::Icmpv6 {
                ty: flow.tp_src as u8,
                code: flow.tp_dst as u8,
            });
            if (flow.tp_src == 135 || flow.tp_src == 136) && flow.tp_dst == 0 {
                attrs.push(OdpKeyAttr::Nd {
                    target: flow.nd_target,
                    sll: flow.arp_sha,
                    tll: flow.arp_tha,
                });
            }
        }
        _ => {}
    }
    attrs
}

/// Flatten a parsed flow into a datapath key. The datapath port of the
/// ingress is supplied by the caller since the flow itself carries the
/// OpenFlow port.
#[must_use]
pub fn flow_to_key(flow: &Flow, in_port: OdpPort) -> OdpFlowKey {
    let mut attrs = Vec::new();
    if flow.skb_priority != 0 {
        attrs.push(OdpKeyAttr::Priority(flow.skb_priority));
    }
    if flow.skb_mark != 0 {
        attrs.push(OdpKeyAttr::SkbMark(flow.skb_mark));
    }
    if !flow.tunnel.is_zero() {
        attrs.push(OdpKeyAttr::Tunnel {
            id: flow.tunnel.tun_id,
            ipv4_src: flow.tunnel.ip_src,
            ipv4_dst: flow.tunnel.ip_dst,
            flags: flow.tunnel.flags.bits(),
            tos: flow.tunnel.ip_tos,
            ttl: flow.tunnel.ip_ttl,
        });
    }
    attrs.push(OdpKeyAttr::InPort(in_port));
    attrs.push(OdpKeyAttr::Ethernet {
        src: flow.dl_src,
        dst: flow.dl_dst,
    });
    if flow.vlan_tci != 0 {
        attrs.push(OdpKeyAttr::EtherType(ETH_TYPE_VLAN));
        attrs.push(OdpKeyAttr::Vlan(flow.vlan_tci));
        let mut encap = Vec::new();
        if flow.dl_type != DL_TYPE_NONE {
            encap.push(OdpKeyAttr::EtherType(flow.dl_type));
        }
        encap.extend(l3_onwards(flow));
        attrs.push(OdpKeyAttr::Encap(encap));
    } else {
        if flow.dl_type != DL_TYPE_NONE {
            attrs.push(OdpKeyAttr::EtherType(flow.dl_type));
        }
        attrs.extend(l3_onwards(flow));
    }
    OdpFlowKey(attrs)
}

fn apply_attrs(attrs: &[OdpKeyAttr], flow: &mut Flow, in_port: &mut OdpPort) {
    for attr in attrs {
        match attr {
            OdpKeyAttr::Priority(p) => flow.skb_priority = *p,
            OdpKeyAttr::SkbMark(m) => flow.skb_mark = *m,
            OdpKeyAttr::Tunnel {
                id,
                ipv4_src,
                ipv4_dst,
                flags,
                tos,
                ttl,
            } => {
                flow.tunnel.tun_id = *id;
                flow.tunnel.ip_src = *ipv4_src;
                flow.tunnel.ip_dst = *ipv4_dst;
                flow.tunnel.flags = TunnelFlags::from_bits_retain(*flags);
                flow.tunnel.ip_tos = *tos;
                flow.tunnel.ip_ttl = *ttl;
            }
            OdpKeyAttr::InPort(p) => *in_port = *p,
            OdpKeyAttr::Ethernet { src, dst } => {
                flow.dl_src = *src;
                flow.dl_dst = *dst;
            }
            OdpKeyAttr::EtherType(t) => {
                if *t != ETH_TYPE_VLAN {
                    flow.dl_type = *t;
                }
            }
            OdpKeyAttr::Vlan(tci) => flow.vlan_tci = *tci,
            OdpKeyAttr::Encap(inner) => apply_attrs(inner, flow, in_port),
            OdpKeyAttr::Ipv4 {
                src,
                dst,
                proto,
                tos,
                ttl,
                frag,
            } => {
                flow.nw_src = *src;
                flow.nw_dst = *dst;
                flow.nw_proto = *proto;
                flow.nw_tos = *tos;
                flow.nw_ttl = *ttl;
                flow.nw_frag = frag.to_flow();
            }
            OdpKeyAttr::Ipv6 {
                src,
                dst,
                label,
                proto,
                tclass,
                hlimit,
                frag,
            } => {
                flow.ipv6_src = *src;
                flow.ipv6_dst = *dst;
                flow.ipv6_label = *label;
                flow.nw_proto = *proto;
                flow.nw_tos = *tclass;
                flow.nw_ttl = *hlimit;
                flow.nw_frag = frag.to_flow();
            }
            OdpKeyAttr::Arp {
                sip,
                tip,
                op,
                sha,
                tha,
            } => {
                flow.nw_src = *sip;
                flow.nw_dst = *tip;
                flow.nw_proto = *op as u8;
                flow.arp_sha = *sha;
                flow.arp_tha = *tha;
            }
            OdpKeyAttr::Tcp { src, dst } => {
                flow.tp_src = *src;
                flow.tp_dst = *dst;
            }
            OdpKeyAttr::Udp { src, dst } => {
                flow.tp_src = *src;
                flow.tp_dst = *dst;
            }
            OdpKeyAttr::Icmp { ty, code } => {
                flow.tp_src = u16::from(*ty);
                flow.tp_dst = u16::from(*code);
            }
            OdpKeyAttr::Icmpv6 { ty, code } => {
                flow.tp_src = u16::from(*ty);
                flow.tp_dst = u16::from(*code);
            }
            OdpKeyAttr::Nd { target, sll, tll } => {
                flow.nd_target = *target;
                flow.arp_sha = *sll;
                flow.arp_tha = *tll;
            }
            OdpKeyAttr::Mpls { lse } => {
                if flow.mpls_lse[0] == 0 {
                    flow.mpls_lse[0] = *lse;
                } else if flow.mpls_lse[1] == 0 {
                    flow.mpls_lse[1] = *lse;
                }
            }
        }
    }
}

/// Parse a key back into a flow, reporting how faithful the parse is.
///
/// The flow's `in_port` is left untouched (it is an OpenFlow port); the key's
/// datapath ingress port is returned separately.
#[must_use]
pub fn key_to_flow(key: &OdpFlowKey) -> (Flow, OdpPort, OdpFitness) {
    let mut flow = Flow::default();
    let mut in_port = OdpPort(0);
    let mut saw_ethernet = false;
    for attr in &key.0 {
        if matches!(attr, OdpKeyAttr::Ethernet { .. }) {
            saw_ethernet = true;
        }
    }
    apply_attrs(&key.0, &mut flow, &mut in_port);
    if flow.dl_type == 0 && saw_ethernet {
        flow.dl_type = DL_TYPE_NONE;
    }
    // A key fits perfectly iff re-flattening the parsed flow reproduces it:
    // anything the key omitted relative to its ethertype shows up as a
    // difference here.
    let fitness = if flow_to_key(&flow, in_port) == *key {
        OdpFitness::Perfect
    } else {
        OdpFitness::TooLittle
    };
    (flow, in_port, fitness)
}

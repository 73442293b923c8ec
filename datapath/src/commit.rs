// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flush pending header rewrites into SET actions.
//!
//! Translation mutates a "current flow" as it walks the OpenFlow action
//! list; the datapath only sees the difference, emitted here as SET actions
//! immediately before any action that consumes the packet (output, sample,
//! userspace). `base` tracks what the packet looks like to the datapath so
//! far and is advanced to `flow` as deltas are emitted.

use crate::action::OdpAction;
use crate::key::OdpKeyAttr;
use flow::{ETH_TYPE_IP, ETH_TYPE_IPV6, ETH_TYPE_VLAN, Flow, FlowFrag};

use crate::key::OdpFrag;

fn commit_tunnel(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if base.tunnel == flow.tunnel {
        return;
    }
    base.tunnel = flow.tunnel;
    out.push(OdpAction::Set(OdpKeyAttr::Tunnel {
        id: flow.tunnel.tun_id,
        ipv4_src: flow.tunnel.ip_src,
        ipv4_dst: flow.tunnel.ip_dst,
        flags: flow.tunnel.flags.bits(),
        tos: flow.tunnel.ip_tos,
        ttl: flow.tunnel.ip_ttl,
    }));
}

fn commit_ethernet(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if base.dl_src == flow.dl_src && base.dl_dst == flow.dl_dst {
        return;
    }
    base.dl_src = flow.dl_src;
    base.dl_dst = flow.dl_dst;
    out.push(OdpAction::Set(OdpKeyAttr::Ethernet {
        src: flow.dl_src,
        dst: flow.dl_dst,
    }));
}

fn commit_vlan(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if base.vlan_tci == flow.vlan_tci {
        return;
    }
    if base.vlan_tci & flow::VLAN_CFI != 0 {
        out.push(OdpAction::PopVlan);
    }
    if flow.vlan_tci & flow::VLAN_CFI != 0 {
        out.push(OdpAction::PushVlan {
            tpid: ETH_TYPE_VLAN,
            tci: flow.vlan_tci,
        });
    }
    base.vlan_tci = flow.vlan_tci;
}

fn commit_mpls(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    // Push/pop are emitted directly by translation; only in-place label
    // rewrites are committed here.
    if base.mpls_lse[0] != flow.mpls_lse[0] && base.mpls_lse[0] != 0 && flow.mpls_lse[0] != 0 {
        out.push(OdpAction::Set(OdpKeyAttr::Mpls {
            lse: flow.mpls_lse[0],
        }));
    }
    base.mpls_lse = flow.mpls_lse;
}

fn odp_frag(frag: FlowFrag) -> OdpFrag {
    if frag.contains(FlowFrag::LATER) {
        OdpFrag::Later
    } else if frag.contains(FlowFrag::ANY) {
        OdpFrag::First
    } else {
        OdpFrag::None
    }
}

fn commit_nw(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if flow.dl_type == ETH_TYPE_IP {
        if (base.nw_src, base.nw_dst, base.nw_tos, base.nw_ttl)
            != (flow.nw_src, flow.nw_dst, flow.nw_tos, flow.nw_ttl)
        {
            out.push(OdpAction::Set(OdpKeyAttr::Ipv4 {
                src: flow.nw_src,
                dst: flow.nw_dst,
                proto: flow.nw_proto,
                tos: flow.nw_tos,
                ttl: flow.nw_ttl,
                frag: odp_frag(flow.nw_frag),
            }));
        }
    } else if flow.dl_type == ETH_TYPE_IPV6
        && (base.ipv6_src, base.ipv6_dst, base.nw_tos, base.nw_ttl, base.ipv6_label)
            != (flow.ipv6_src, flow.ipv6_dst, flow.nw_tos, flow.nw_ttl, flow.ipv6_label)
    {
        out.push(OdpAction::Set(OdpKeyAttr::Ipv6 {
            src: flow.ipv6_src,
            dst: flow.ipv6_dst,
            label: flow.ipv6_label,
            proto: flow.nw_proto,
            tclass: flow.nw_tos,
            hlimit: flow.nw_ttl,
            frag: odp_frag(flow.nw_frag),
        }));
    }
    base.nw_src = flow.nw_src;
    base.nw_dst = flow.nw_dst;
    base.ipv6_src = flow.ipv6_src;
    base.ipv6_dst = flow.ipv6_dst;
    base.ipv6_label = flow.ipv6_label;
    base.nw_tos = flow.nw_tos;
    base.nw_ttl = flow.nw_ttl;
}

fn commit_ports(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if base.tp_src == flow.tp_src && base.tp_dst == flow.tp_dst {
        return;
    }
    match flow.nw_proto {
        6 => out.push(OdpAction::Set(OdpKeyAttr::Tcp {
            src: flow.tp_src,
            dst: flow.tp_dst,
        })),
        17 => out.push(OdpAction::Set(OdpKeyAttr::Udp {
            src: flow.tp_src,
            dst: flow.tp_dst,
        })),
        _ => {}
    }
    base.tp_src = flow.tp_src;
    base.tp_dst = flow.tp_dst;
}

fn commit_priority(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    if base.skb_priority != flow.skb_priority {
        base.skb_priority = flow.skb_priority;
        out.push(OdpAction::Set(OdpKeyAttr::Priority(flow.skb_priority)));
    }
    if base.skb_mark != flow.skb_mark {
        base.skb_mark = flow.skb_mark;
        out.push(OdpAction::Set(OdpKeyAttr::SkbMark(flow.skb_mark)));
    }
}

/// Emit SET/PUSH/POP actions for every difference between `base` and `flow`,
/// advancing `base` to match.
pub fn commit_odp_actions(base: &mut Flow, flow: &Flow, out: &mut Vec<OdpAction>) {
    commit_tunnel(base, flow, out);
    commit_ethernet(base, flow, out);
    commit_vlan(base, flow, out);
    commit_mpls(base, flow, out);
    commit_nw(base, flow, out);
    commit_ports(base, flow, out);
    commit_priority(base, flow, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::{EthAddr, vid_pcp_to_tci};
    use std::net::Ipv4Addr;

    #[test]
    fn no_change_no_actions() {
        let f = Flow::default();
        let mut base = f;
        let mut out = Vec::new();
        commit_odp_actions(&mut base, &f, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn vlan_rewrite_is_pop_then_push() {
        let mut base = Flow {
            vlan_tci: vid_pcp_to_tci(10, 0),
            ..Flow::default()
        };
        let flow = Flow {
            vlan_tci: vid_pcp_to_tci(20, 0),
            ..Flow::default()
        };
        let mut out = Vec::new();
        commit_odp_actions(&mut base, &flow, &mut out);
        assert_eq!(
            out,
            vec![
                OdpAction::PopVlan,
                OdpAction::PushVlan {
                    tpid: ETH_TYPE_VLAN,
                    tci: vid_pcp_to_tci(20, 0),
                },
            ]
        );
        assert_eq!(base.vlan_tci, flow.vlan_tci);
    }

    #[test]
    fn ipv4_and_port_rewrites() {
        let mut base = Flow {
            dl_type: ETH_TYPE_IP,
            nw_proto: 6,
            nw_src: Ipv4Addr::new(10, 0, 0, 1),
            tp_src: 1000,
            ..Flow::default()
        };
        let mut flow = base;
        flow.nw_src = Ipv4Addr::new(172, 16, 0, 1);
        flow.tp_src = 2000;
        let mut out = Vec::new();
        commit_odp_actions(&mut base, &flow, &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], OdpAction::Set(OdpKeyAttr::Ipv4 { .. })));
        assert!(matches!(
            out[1],
            OdpAction::Set(OdpKeyAttr::Tcp { src: 2000, .. })
        ));
    }

    #[test]
    fn eth_rewrite_once() {
        let mut base = Flow::default();
        let flow = Flow {
            dl_dst: EthAddr([1, 2, 3, 4, 5, 6]),
            ..Flow::default()
        };
        let mut out = Vec::new();
        commit_odp_actions(&mut base, &flow, &mut out);
        commit_odp_actions(&mut base, &flow, &mut out);
        assert_eq!(out.len(), 1);
    }
}

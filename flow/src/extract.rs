// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet bytes → [`Flow`].
//!
//! The walk is lenient the way a datapath's own extractor is: a truncated
//! header ends the walk with whatever was parsed so far rather than failing
//! the packet, since a flow with zeroed upper-layer fields is still a valid
//! (if coarse) fingerprint.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::flow::{
    DL_TYPE_NONE, ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_IPV6, ETH_TYPE_MPLS, ETH_TYPE_MPLS_MCAST,
    ETH_TYPE_VLAN, EthAddr, FLOW_MAX_MPLS_LABELS, Flow, FlowFrag, FlowTunnel, MPLS_BOS_MASK,
    OfPort, VLAN_CFI,
};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

const ND_NEIGHBOR_SOLICIT: u8 = 135;
const ND_NEIGHBOR_ADVERT: u8 = 136;

/// Out-of-band context a packet arrives with.
#[derive(Clone, Copy, Default, Debug)]
pub struct FlowMetadata {
    pub tunnel: FlowTunnel,
    pub skb_priority: u32,
    pub skb_mark: u32,
    pub in_port: OfPort,
}

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.at.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let out = &self.data[self.at..end];
        self.at = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn eth(&mut self) -> Option<EthAddr> {
        let b = self.take(6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(b);
        Some(EthAddr(out))
    }

    fn ipv4(&mut self) -> Option<Ipv4Addr> {
        let b = self.take(4)?;
        Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn ipv6(&mut self) -> Option<Ipv6Addr> {
        let b = self.take(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(b);
        Some(Ipv6Addr::from(out))
    }
}

/// Parse a packet into a flow.
#[must_use]
pub fn extract(packet: &[u8], md: &FlowMetadata) -> Flow {
    extract_full(packet, md).0
}

/// TCP flag byte of a packet, zero for anything that is not unfragmented TCP.
#[must_use]
pub fn extract_tcp_flags(packet: &[u8]) -> u8 {
    extract_full(packet, &FlowMetadata::default()).1
}

fn extract_full(packet: &[u8], md: &FlowMetadata) -> (Flow, u8) {
    let mut flow = Flow {
        tunnel: md.tunnel,
        skb_priority: md.skb_priority,
        skb_mark: md.skb_mark,
        in_port: md.in_port,
        ..Flow::default()
    };
    let mut tcp_flags = 0u8;
    let mut c = Cursor {
        data: packet,
        at: 0,
    };

    let Some(dl_dst) = c.eth() else {
        return (flow, 0);
    };
    let Some(dl_src) = c.eth() else {
        return (flow, 0);
    };
    flow.dl_dst = dl_dst;
    flow.dl_src = dl_src;

    let Some(mut dl_type) = c.u16() else {
        return (flow, 0);
    };
    if dl_type == ETH_TYPE_VLAN {
        let Some(tci) = c.u16() else {
            return (flow, 0);
        };
        flow.vlan_tci = tci | VLAN_CFI;
        match c.u16() {
            Some(inner) => dl_type = inner,
            None => return (flow, 0),
        }
    }
    if dl_type < 0x600 {
        dl_type = DL_TYPE_NONE;
    }
    flow.dl_type = dl_type;

    match dl_type {
        ETH_TYPE_MPLS | ETH_TYPE_MPLS_MCAST => {
            for i in 0..FLOW_MAX_MPLS_LABELS {
                let Some(lse) = c.u32() else { break };
                if lse == 0 {
                    // An all-zero LSE is not a usable stack entry; stop so
                    // the stack stays dense (lse[1] set implies lse[0] set).
                    break;
                }
                flow.mpls_lse[i] = lse;
                if lse & MPLS_BOS_MASK != 0 {
                    break;
                }
            }
        }
        ETH_TYPE_IP => {
            if let Some(flags) = parse_ipv4(&mut c, &mut flow) {
                tcp_flags = flags;
            }
        }
        ETH_TYPE_IPV6 => {
            if let Some(flags) = parse_ipv6(&mut c, &mut flow) {
                tcp_flags = flags;
            }
        }
        ETH_TYPE_ARP => {
            parse_arp(&mut c, &mut flow);
        }
        _ => {}
    }
    (flow, tcp_flags)
}

fn parse_l4(c: &mut Cursor<'_>, flow: &mut Flow) -> Option<u8> {
    match flow.nw_proto {
        IPPROTO_TCP => {
            flow.tp_src = c.u16()?;
            flow.tp_dst = c.u16()?;
            c.take(9)?; // seq, ack, offset
            let flags = c.u8()?;
            Some(flags)
        }
        IPPROTO_UDP => {
            flow.tp_src = c.u16()?;
            flow.tp_dst = c.u16()?;
            Some(0)
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            flow.tp_src = u16::from(c.u8()?);
            flow.tp_dst = u16::from(c.u8()?);
            Some(0)
        }
        _ => Some(0),
    }
}

fn parse_ipv4(c: &mut Cursor<'_>, flow: &mut Flow) -> Option<u8> {
    let ver_ihl = c.u8()?;
    if ver_ihl >> 4 != 4 {
        return Some(0);
    }
    let ihl = usize::from(ver_ihl & 0x0f) * 4;
    if ihl < 20 {
        return Some(0);
    }
    flow.nw_tos = c.u8()?;
    c.u16()?; // total length
    c.u16()?; // id
    let frag = c.u16()?;
    flow.nw_ttl = c.u8()?;
    flow.nw_proto = c.u8()?;
    c.u16()?; // checksum
    flow.nw_src = c.ipv4()?;
    flow.nw_dst = c.ipv4()?;
    c.take(ihl - 20)?; // options

    let offset = frag & 0x1fff;
    let more = frag & 0x2000 != 0;
    if offset != 0 || more {
        flow.nw_frag = FlowFrag::ANY;
        if offset != 0 {
            flow.nw_frag |= FlowFrag::LATER;
            return Some(0);
        }
    }
    parse_l4(c, flow)
}

fn parse_ipv6(c: &mut Cursor<'_>, flow: &mut Flow) -> Option<u8> {
    let vtf = c.u32()?;
    if vtf >> 28 != 6 {
        return Some(0);
    }
    flow.nw_tos = ((vtf >> 20) & 0xff) as u8;
    flow.ipv6_label = vtf & 0x000f_ffff;
    c.u16()?; // payload length
    let mut next = c.u8()?;
    flow.nw_ttl = c.u8()?;
    flow.ipv6_src = c.ipv6()?;
    flow.ipv6_dst = c.ipv6()?;

    // Walk extension headers until a transport protocol or a fragment header.
    loop {
        match next {
            0 | 43 | 60 => {
                next = c.u8()?;
                let len = usize::from(c.u8()?);
                c.take(6 + len * 8)?;
            }
            44 => {
                next = c.u8()?;
                c.u8()?; // reserved
                let off_flags = c.u16()?;
                c.u32()?; // identification
                flow.nw_frag = FlowFrag::ANY;
                if off_flags & 0xfff8 != 0 {
                    flow.nw_frag |= FlowFrag::LATER;
                    flow.nw_proto = next;
                    return Some(0);
                }
            }
            _ => break,
        }
    }
    flow.nw_proto = next;
    if next == IPPROTO_ICMPV6 {
        let icmp_type = c.u8()?;
        let icmp_code = c.u8()?;
        flow.tp_src = u16::from(icmp_type);
        flow.tp_dst = u16::from(icmp_code);
        if (icmp_type == ND_NEIGHBOR_SOLICIT || icmp_type == ND_NEIGHBOR_ADVERT) && icmp_code == 0
        {
            c.take(6)?; // checksum + reserved
            flow.nd_target = c.ipv6()?;
            // Source/target link-layer address options.
            while let Some(opt_type) = c.u8() {
                let Some(opt_len) = c.u8() else { break };
                if opt_len == 0 {
                    break;
                }
                let body = usize::from(opt_len) * 8 - 2;
                if opt_type == 1 && body == 6 {
                    flow.arp_sha = c.eth()?;
                } else if opt_type == 2 && body == 6 {
                    flow.arp_tha = c.eth()?;
                } else {
                    c.take(body)?;
                }
            }
        }
        return Some(0);
    }
    parse_l4(c, flow)
}

fn parse_arp(c: &mut Cursor<'_>, flow: &mut Flow) -> Option<()> {
    let htype = c.u16()?;
    let ptype = c.u16()?;
    let hlen = c.u8()?;
    let plen = c.u8()?;
    let op = c.u16()?;
    if htype != 1 || ptype != ETH_TYPE_IP || hlen != 6 || plen != 4 {
        return None;
    }
    if op <= 0xff {
        flow.nw_proto = op as u8;
    }
    flow.arp_sha = c.eth()?;
    flow.nw_src = c.ipv4()?;
    flow.arp_tha = c.eth()?;
    flow.nw_dst = c.ipv4()?;
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets;
    use crate::tcp_flags::{ACK, SYN};

    fn md(port: u16) -> FlowMetadata {
        FlowMetadata {
            in_port: OfPort(port),
            ..FlowMetadata::default()
        }
    }

    const SRC: EthAddr = EthAddr([0xaa, 0, 0, 0, 0, 1]);
    const DST: EthAddr = EthAddr([0xaa, 0, 0, 0, 0, 2]);

    #[test]
    fn tcp_over_vlan() {
        let pkt = packets::ipv4_tcp(
            SRC,
            DST,
            Some((10, 5)),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            80,
            SYN | ACK,
        );
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.in_port, OfPort(1));
        assert_eq!(flow.dl_src, SRC);
        assert_eq!(flow.dl_dst, DST);
        assert_eq!(flow.dl_type, ETH_TYPE_IP);
        assert_eq!(flow.vlan_vid(), 10);
        assert_ne!(flow.vlan_tci & VLAN_CFI, 0);
        assert_eq!(flow.nw_proto, IPPROTO_TCP);
        assert_eq!(flow.nw_src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(flow.tp_src, 1234);
        assert_eq!(flow.tp_dst, 80);
        assert_eq!(extract_tcp_flags(&pkt), SYN | ACK);
    }

    #[test]
    fn untagged_has_zero_tci() {
        let pkt = packets::ipv4_udp(
            SRC,
            DST,
            None,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            53,
            53,
        );
        let flow = extract(&pkt, &md(2));
        assert_eq!(flow.vlan_tci, 0);
        assert_eq!(flow.nw_proto, IPPROTO_UDP);
    }

    #[test]
    fn later_fragment_zeroes_transport() {
        let pkt = packets::ipv4_fragment(
            SRC,
            DST,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            185,
            false,
        );
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.nw_frag, FlowFrag::ANY | FlowFrag::LATER);
        assert_eq!(flow.tp_src, 0);
        assert_eq!(flow.tp_dst, 0);
    }

    #[test]
    fn first_fragment_keeps_ports() {
        let pkt = packets::ipv4_fragment(
            SRC,
            DST,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            0,
            true,
        );
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.nw_frag, FlowFrag::ANY);
    }

    #[test]
    fn gratuitous_arp_frame() {
        let sha = EthAddr([0xaa, 0, 0, 0, 0, 9]);
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let pkt = packets::arp(sha, EthAddr::BROADCAST, 1, sha, ip, EthAddr::default(), ip);
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.dl_type, ETH_TYPE_ARP);
        assert_eq!(flow.nw_proto, 1);
        assert!(flow.is_gratuitous_arp());
        assert_eq!(flow.arp_sha, sha);
    }

    #[test]
    fn icmp_type_code_in_ports() {
        let pkt = packets::icmp4(
            SRC,
            DST,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            8,
            0,
        );
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.nw_proto, IPPROTO_ICMP);
        assert_eq!(flow.tp_src, 8);
        assert_eq!(flow.tp_dst, 0);
    }

    #[test]
    fn runt_frame_parses_to_l2_only() {
        let flow = extract(&[0xaa; 10], &md(1));
        assert_eq!(flow.dl_type, 0);
        assert_eq!(flow.in_port, OfPort(1));
    }

    #[test]
    fn llc_frame_gets_synthetic_dl_type() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&DST.0);
        pkt.extend_from_slice(&SRC.0);
        pkt.extend_from_slice(&100u16.to_be_bytes()); // 802.3 length, not a type
        pkt.extend_from_slice(&[0u8; 100]);
        let flow = extract(&pkt, &md(1));
        assert_eq!(flow.dl_type, DL_TYPE_NONE);
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Frame builders for tests.
//!
//! Checksums are left zero; nothing in the engine verifies them.

use std::net::Ipv4Addr;

use crate::flow::{ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_VLAN, EthAddr};

fn eth_header(src: EthAddr, dst: EthAddr, vlan: Option<(u16, u8)>, ethertype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend_from_slice(&dst.0);
    out.extend_from_slice(&src.0);
    if let Some((vid, pcp)) = vlan {
        out.extend_from_slice(&ETH_TYPE_VLAN.to_be_bytes());
        let tci = (vid & 0x0fff) | (u16::from(pcp) << 13);
        out.extend_from_slice(&tci.to_be_bytes());
    }
    out.extend_from_slice(&ethertype.to_be_bytes());
    out
}

fn ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    payload_len: usize,
    frag_off_words: u16,
    more_fragments: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // id
    let mut frag = frag_off_words & 0x1fff;
    if more_fragments {
        frag |= 0x2000;
    }
    out.extend_from_slice(&frag.to_be_bytes());
    out.push(64); // ttl
    out.push(proto);
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    out
}

/// An untagged or 802.1Q-tagged TCP/IPv4 frame.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn ipv4_tcp(
    src: EthAddr,
    dst: EthAddr,
    vlan: Option<(u16, u8)>,
    nw_src: Ipv4Addr,
    nw_dst: Ipv4Addr,
    tp_src: u16,
    tp_dst: u16,
    tcp_flags: u8,
) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20);
    tcp.extend_from_slice(&tp_src.to_be_bytes());
    tcp.extend_from_slice(&tp_dst.to_be_bytes());
    tcp.extend_from_slice(&[0u8; 8]); // seq + ack
    tcp.push(0x50); // data offset
    tcp.push(tcp_flags);
    tcp.extend_from_slice(&[0u8; 6]); // window, checksum, urgent
    let mut out = eth_header(src, dst, vlan, ETH_TYPE_IP);
    out.extend_from_slice(&ipv4_header(nw_src, nw_dst, 6, tcp.len(), 0, false));
    out.extend_from_slice(&tcp);
    out
}

/// An untagged or tagged UDP/IPv4 frame.
#[must_use]
pub fn ipv4_udp(
    src: EthAddr,
    dst: EthAddr,
    vlan: Option<(u16, u8)>,
    nw_src: Ipv4Addr,
    nw_dst: Ipv4Addr,
    tp_src: u16,
    tp_dst: u16,
) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8);
    udp.extend_from_slice(&tp_src.to_be_bytes());
    udp.extend_from_slice(&tp_dst.to_be_bytes());
    udp.extend_from_slice(&8u16.to_be_bytes());
    udp.extend_from_slice(&0u16.to_be_bytes());
    let mut out = eth_header(src, dst, vlan, ETH_TYPE_IP);
    out.extend_from_slice(&ipv4_header(nw_src, nw_dst, 17, udp.len(), 0, false));
    out.extend_from_slice(&udp);
    out
}

/// An IPv4 UDP fragment. `frag_off_words` is in 8-byte units; nonzero makes
/// it a later fragment.
#[must_use]
pub fn ipv4_fragment(
    src: EthAddr,
    dst: EthAddr,
    nw_src: Ipv4Addr,
    nw_dst: Ipv4Addr,
    frag_off_words: u16,
    more_fragments: bool,
) -> Vec<u8> {
    let payload = [0u8; 16];
    let mut out = eth_header(src, dst, None, ETH_TYPE_IP);
    out.extend_from_slice(&ipv4_header(
        nw_src,
        nw_dst,
        17,
        payload.len(),
        frag_off_words,
        more_fragments || frag_off_words == 0,
    ));
    out.extend_from_slice(&payload);
    out
}

/// An ICMPv4 frame.
#[must_use]
pub fn icmp4(
    src: EthAddr,
    dst: EthAddr,
    nw_src: Ipv4Addr,
    nw_dst: Ipv4Addr,
    icmp_type: u8,
    icmp_code: u8,
) -> Vec<u8> {
    let icmp = [icmp_type, icmp_code, 0, 0, 0, 0, 0, 0];
    let mut out = eth_header(src, dst, None, ETH_TYPE_IP);
    out.extend_from_slice(&ipv4_header(nw_src, nw_dst, 1, icmp.len(), 0, false));
    out.extend_from_slice(&icmp);
    out
}

/// An Ethernet ARP frame. Pass `sha == spa-owner` and `spa == tpa` for a
/// gratuitous ARP.
#[must_use]
pub fn arp(
    src: EthAddr,
    dst: EthAddr,
    op: u16,
    sha: EthAddr,
    spa: Ipv4Addr,
    tha: EthAddr,
    tpa: Ipv4Addr,
) -> Vec<u8> {
    let mut out = eth_header(src, dst, None, ETH_TYPE_ARP);
    out.extend_from_slice(&1u16.to_be_bytes()); // htype
    out.extend_from_slice(&ETH_TYPE_IP.to_be_bytes()); // ptype
    out.push(6);
    out.push(4);
    out.extend_from_slice(&op.to_be_bytes());
    out.extend_from_slice(&sha.0);
    out.extend_from_slice(&spa.octets());
    out.extend_from_slice(&tha.0);
    out.extend_from_slice(&tpa.octets());
    out
}

/// A minimal frame with an arbitrary ethertype and payload, tagged or not.
#[must_use]
pub fn raw_eth(
    src: EthAddr,
    dst: EthAddr,
    vlan: Option<(u16, u8)>,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = eth_header(src, dst, vlan, ethertype);
    out.extend_from_slice(payload);
    out
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! # Flow model
//!
//! The dense parsed-packet record ([`Flow`]), its per-bit mask twin
//! ([`Wildcards`]) and the compact word-packed representations
//! ([`Miniflow`] / [`Minimask`]) that the classifier and the flow cache key
//! on.
//!
//! A [`Flow`] is an ordered bag of (field, value) pairs covering the full
//! match space; equality is bitwise over the whole record. Every field also
//! has a fixed position in a canonical array of 32-bit words
//! ([`Flow::to_words`]), which is what masking, masked hashing and the
//! compact forms operate on. The two views are interchangeable:
//! `Flow::from_words(f.to_words()) == f` for every flow.

mod extract;
mod flow;
mod hash;
mod miniflow;
mod wildcards;

#[cfg(any(test, feature = "test-helpers"))]
pub mod packets;

pub use extract::{FlowMetadata, extract, extract_tcp_flags};
pub use flow::{
    DL_TYPE_NONE, ETH_TYPE_ARP, ETH_TYPE_IP, ETH_TYPE_IPV6, ETH_TYPE_MPLS, ETH_TYPE_MPLS_MCAST,
    ETH_TYPE_SLOW, ETH_TYPE_VLAN, EthAddr, FLOW_MAX_MPLS_LABELS, FLOW_N_REGS, FLOW_WORDS, Flow,
    FlowFrag, FlowTunnel, MPLS_BOS_MASK, MPLS_LABEL_SHIFT, MPLS_TTL_MASK, OfPort, TunnelFlags,
    VLAN_CFI, VLAN_PCP_MASK, VLAN_PCP_SHIFT, VLAN_VID_MASK, vid_pcp_to_tci,
};
pub use hash::{hash_words, map_hasher};
pub use miniflow::{Miniflow, Minimask};
pub use wildcards::Wildcards;

/// TCP flag bits as found in the TCP header's low flag byte.
pub mod tcp_flags {
    /// Sender finished sending.
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers.
    pub const SYN: u8 = 0x02;
    /// Reset the connection.
    pub const RST: u8 = 0x04;
    /// Push function.
    pub const PSH: u8 = 0x08;
    /// Acknowledgement field significant.
    pub const ACK: u8 = 0x10;
}

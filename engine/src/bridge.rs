// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;

use flow::{Flow, FlowFrag, OfPort, Wildcards, map_hasher};
use openflow::{OfAction, PacketInReason, RuleId, RuleKind, RuleTable};

use crate::bundle::Bundle;
use crate::facet::Facet;
use crate::ipfix::IpfixAgent;
use crate::mac::MacLearning;
use crate::mirror::{MAX_MIRRORS, Mirror, MirrorMask};
use crate::netflow::NetFlow;
use crate::port::{Port, PortFlags};
use crate::sflow::SflowAgent;

/// How the bridge treats IP fragments.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum FragHandling {
    /// Zero the transport ports before lookup so all fragments of a
    /// datagram match alike.
    #[default]
    Normal,
    /// Drop every fragment.
    Drop,
    /// Pass fragments through with their fields as parsed.
    NxMatch,
}

/// A packet bound for the OpenFlow controller, queued for the connection
/// manager to drain.
#[derive(Clone, Debug)]
pub struct PacketIn {
    pub packet: Bytes,
    pub reason: PacketInReason,
    pub table_id: u8,
    pub cookie: u64,
    pub flow: Flow,
    pub controller_id: u16,
    pub send_len: u16,
}

/// Miss-rule packet-in truncation default.
pub const DEFAULT_MISS_SEND_LEN: u16 = 128;

/// One OpenFlow switch instance.
pub struct Bridge {
    pub name: String,
    /// Backer (datapath instance) this bridge multiplexes over.
    pub backer: String,
    pub ports: HashMap<OfPort, Port, ahash::RandomState>,
    pub ports_by_name: HashMap<String, OfPort, ahash::RandomState>,
    pub(crate) next_ofp: u16,
    pub bundles: HashMap<String, Bundle, ahash::RandomState>,
    pub mirrors: Box<[Option<Mirror>; MAX_MIRRORS]>,
    pub ml: MacLearning,
    pub rules: RuleTable,
    pub miss_rule: RuleId,
    pub no_packet_in_rule: RuleId,
    pub drop_frags_rule: RuleId,
    pub facets: HashMap<Flow, Facet, ahash::RandomState>,
    pub frag_handling: FragHandling,
    pub netflow: Option<NetFlow>,
    pub sflow: Option<SflowAgent>,
    pub ipfix: Option<IpfixAgent>,
    pub stp_enabled: bool,
    pub packet_ins: VecDeque<PacketIn>,
    /// Upcalls resolved from / missed by the facet cache.
    pub n_hit: u64,
    pub n_missed: u64,
    /// Control frames intercepted for their port subsystems.
    pub n_special: u64,
}

impl Bridge {
    pub(crate) fn new(name: &str, backer: &str, now: Instant) -> Bridge {
        let mut rules = RuleTable::new();
        let miss_rule = rules.add_internal(
            RuleKind::Miss,
            vec![OfAction::Controller {
                max_len: DEFAULT_MISS_SEND_LEN,
                controller_id: 0,
                reason: PacketInReason::NoMatch,
            }],
            now,
        );
        let no_packet_in_rule = rules.add_internal(RuleKind::NoPacketIn, Vec::new(), now);
        let drop_frags_rule = rules.add_internal(RuleKind::DropFrags, Vec::new(), now);
        let ml_basis = {
            let words: Vec<u32> = name.bytes().map(u32::from).collect();
            flow::hash_words(&words, 0)
        };
        Bridge {
            name: name.to_string(),
            backer: backer.to_string(),
            ports: HashMap::with_hasher(map_hasher()),
            ports_by_name: HashMap::with_hasher(map_hasher()),
            next_ofp: 1,
            bundles: HashMap::with_hasher(map_hasher()),
            mirrors: Box::new(std::array::from_fn(|_| None)),
            ml: MacLearning::new(ml_basis),
            rules,
            miss_rule,
            no_packet_in_rule,
            drop_frags_rule,
            facets: HashMap::with_hasher(map_hasher()),
            frag_handling: FragHandling::default(),
            netflow: None,
            sflow: None,
            ipfix: None,
            stp_enabled: false,
            packet_ins: VecDeque::new(),
            n_hit: 0,
            n_missed: 0,
            n_special: 0,
        }
    }

    #[must_use]
    pub fn port_by_name(&self, name: &str) -> Option<&Port> {
        self.ports_by_name.get(name).and_then(|ofp| self.ports.get(ofp))
    }

    #[must_use]
    pub fn bundle_for_port(&self, ofp: OfPort) -> Option<&Bundle> {
        self.ports
            .get(&ofp)
            .and_then(|p| p.bundle.as_ref())
            .and_then(|name| self.bundles.get(name))
    }

    /// The rule-table adapter's lookup: marks the mandatory wildcard bits,
    /// applies the bridge's fragment policy, and falls back to the
    /// synthetic rules so the result is never "nothing".
    #[must_use]
    pub fn rule_lookup(
        &self,
        flow: &Flow,
        mut wc: Option<&mut Wildcards>,
        table_id: u8,
    ) -> RuleId {
        if let Some(wc) = wc.as_deref_mut() {
            wc.masks.dl_type = 0xffff;
            wc.masks.nw_frag = FlowFrag::from_bits_retain(0xff);
            wc.masks.in_port = OfPort(u16::MAX);
        }
        if flow.nw_frag.contains(FlowFrag::ANY) && self.frag_handling == FragHandling::Drop {
            if let Some(wc) = wc {
                *wc = Wildcards::exact();
            }
            return self.drop_frags_rule;
        }
        let lookup_flow = if flow.nw_frag.contains(FlowFrag::ANY)
            && self.frag_handling == FragHandling::Normal
        {
            let mut f = *flow;
            f.zero_transport();
            f
        } else {
            *flow
        };
        match self.rules.lookup(table_id, &lookup_flow, wc) {
            Some(id) => id,
            None => {
                let suppressed = self
                    .ports
                    .get(&flow.in_port)
                    .is_some_and(|p| p.flags.contains(PortFlags::NO_PACKET_IN));
                if suppressed {
                    self.no_packet_in_rule
                } else {
                    self.miss_rule
                }
            }
        }
    }

    /// Credit mirror counters for traffic attributed to a mirror set.
    pub fn credit_mirrors(&mut self, mirrors: MirrorMask, packets: u64, bytes: u64) {
        for idx in mirrors.iter() {
            if let Some(m) = self.mirrors[idx].as_mut() {
                m.packet_count += packets;
                m.byte_count += bytes;
            }
        }
    }

    /// Drain queued packet-ins for the connection manager.
    pub fn take_packet_ins(&mut self) -> Vec<PacketIn> {
        self.packet_ins.drain(..).collect()
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NetFlow attribution.
//!
//! The engine's part of NetFlow is accounting: per-facet flows accumulate
//! deltas from stats pushes and are flushed into expiry records, either when
//! the facet dies or when the active timeout passes. Encoding and transport
//! of the records is the collector's business, not ours; records queue
//! in memory for an external sender.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use flow::{Flow, map_hasher};

/// Egress attributed to a NetFlow record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NfOutput {
    /// Single output port.
    Iface(u16),
    /// More than one output.
    Multi,
    /// Flooded.
    Flood,
    /// Dropped.
    None,
}

#[derive(Clone, Debug)]
pub struct NetFlowConfig {
    pub engine_type: u8,
    pub engine_id: u8,
    /// Flush a live flow's counters at this interval even without expiry.
    pub active_timeout: Duration,
    /// Cap on queued records.
    pub max_records: usize,
}

impl Default for NetFlowConfig {
    fn default() -> Self {
        NetFlowConfig {
            engine_type: 0,
            engine_id: 0,
            active_timeout: Duration::from_secs(600),
            max_records: 1024,
        }
    }
}

/// One v5-style expiry record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetFlowRecord {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub input_iface: u16,
    pub output: NfOutput,
    pub packets: u64,
    pub bytes: u64,
    pub first: Instant,
    pub last: Instant,
    pub tp_src: u16,
    pub tp_dst: u16,
    pub ip_proto: u8,
    pub ip_tos: u8,
}

#[derive(Clone, Debug)]
struct NfFlow {
    created: Instant,
    last_flushed: Instant,
    packets: u64,
    bytes: u64,
    used: Instant,
    output: NfOutput,
}

pub struct NetFlow {
    pub config: NetFlowConfig,
    flows: HashMap<Flow, NfFlow, ahash::RandomState>,
    records: VecDeque<NetFlowRecord>,
    pub n_dropped_records: u64,
}

impl NetFlow {
    #[must_use]
    pub fn new(config: NetFlowConfig) -> NetFlow {
        NetFlow {
            config,
            flows: HashMap::with_hasher(map_hasher()),
            records: VecDeque::new(),
            n_dropped_records: 0,
        }
    }

    /// Credit a stats delta to the facet's NetFlow flow.
    pub fn observe(
        &mut self,
        facet_flow: &Flow,
        output: NfOutput,
        packets: u64,
        bytes: u64,
        used: Instant,
    ) {
        let entry = self.flows.entry(*facet_flow).or_insert(NfFlow {
            created: used,
            last_flushed: used,
            packets: 0,
            bytes: 0,
            used,
            output,
        });
        entry.packets += packets;
        entry.bytes += bytes;
        entry.used = entry.used.max(used);
        entry.output = output;
    }

    fn push_record(&mut self, facet_flow: &Flow, nf: &NfFlow) {
        if nf.packets == 0 {
            return;
        }
        if self.records.len() >= self.config.max_records {
            self.n_dropped_records += 1;
            self.records.pop_front();
        }
        self.records.push_back(NetFlowRecord {
            src_addr: facet_flow.nw_src,
            dst_addr: facet_flow.nw_dst,
            input_iface: facet_flow.in_port.0,
            output: nf.output,
            packets: nf.packets,
            bytes: nf.bytes,
            first: nf.created,
            last: nf.used,
            tp_src: facet_flow.tp_src,
            tp_dst: facet_flow.tp_dst,
            ip_proto: facet_flow.nw_proto,
            ip_tos: facet_flow.nw_tos,
        });
    }

    /// The facet died; emit its final record.
    pub fn expire(&mut self, facet_flow: &Flow) {
        if let Some(nf) = self.flows.remove(facet_flow) {
            self.push_record(facet_flow, &nf);
        }
    }

    /// Flush counters of flows past the active timeout.
    pub fn run(&mut self, now: Instant) {
        let due: Vec<Flow> = self
            .flows
            .iter()
            .filter(|(_, nf)| now.duration_since(nf.last_flushed) >= self.config.active_timeout)
            .map(|(f, _)| *f)
            .collect();
        for f in due {
            if let Some(nf) = self.flows.get(&f).cloned() {
                self.push_record(&f, &nf);
                if let Some(live) = self.flows.get_mut(&f) {
                    live.packets = 0;
                    live.bytes = 0;
                    live.last_flushed = now;
                }
            }
        }
    }

    /// Drain queued records for transmission.
    pub fn take_records(&mut self) -> Vec<NetFlowRecord> {
        self.records.drain(..).collect()
    }

    #[must_use]
    pub fn n_active(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::OfPort;

    fn flow() -> Flow {
        Flow {
            in_port: OfPort(1),
            nw_src: Ipv4Addr::new(10, 0, 0, 1),
            nw_dst: Ipv4Addr::new(10, 0, 0, 2),
            nw_proto: 6,
            tp_src: 40000,
            tp_dst: 443,
            ..Flow::default()
        }
    }

    #[test]
    fn expire_emits_accumulated_counters() {
        let now = Instant::now();
        let mut nf = NetFlow::new(NetFlowConfig::default());
        let f = flow();
        nf.observe(&f, NfOutput::Iface(2), 3, 300, now);
        nf.observe(&f, NfOutput::Iface(2), 2, 200, now + Duration::from_secs(1));
        nf.expire(&f);
        let records = nf.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].packets, 5);
        assert_eq!(records[0].bytes, 500);
        assert_eq!(records[0].output, NfOutput::Iface(2));
        assert_eq!(nf.n_active(), 0);
    }

    #[test]
    fn active_timeout_flushes_without_expiry() {
        let now = Instant::now();
        let mut nf = NetFlow::new(NetFlowConfig {
            active_timeout: Duration::from_secs(10),
            ..NetFlowConfig::default()
        });
        let f = flow();
        nf.observe(&f, NfOutput::Multi, 1, 100, now);
        nf.run(now + Duration::from_secs(5));
        assert!(nf.take_records().is_empty());
        nf.run(now + Duration::from_secs(11));
        let records = nf.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(nf.n_active(), 1, "flow stays active after a flush");
    }

    #[test]
    fn zero_delta_expiry_is_silent() {
        let mut nf = NetFlow::new(NetFlowConfig::default());
        let f = flow();
        nf.observe(&f, NfOutput::None, 0, 0, Instant::now());
        nf.expire(&f);
        assert!(nf.take_records().is_empty());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! An in-memory datapath.
//!
//! Complete enough to close the loop in tests: installed flows match
//! injected packets under their masks, matched packets run their action
//! lists (recording outputs and queueing ACTION upcalls), unmatched packets
//! queue MISS upcalls exactly like a kernel datapath would.
//!
//! The engine is single-threaded cooperative, so the shared state between
//! the [`Dpif`] half and the test-facing [`DummyHandle`] is a plain
//! `Rc<RefCell>`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::action::OdpAction;
use crate::dpif::{
    DpError, DpFlowEntry, DpOp, Dpif, FlowPut, FlowStats, OpResult, PutFlags, Upcall, UpcallKind,
};
use crate::key::{OdpFitness, OdpFlowKey, OdpPort, flow_to_key, key_to_flow};
use flow::{Flow, FlowMetadata, OfPort, Wildcards, extract, extract_tcp_flags, map_hasher};

/// A packet emitted on a datapath port, with the VLAN state it left with.
#[derive(Clone, Debug)]
pub struct SentPacket {
    pub port: OdpPort,
    pub packet: Bytes,
    /// TCI (CFI set) the frame carries on the wire, 0 if untagged.
    pub vlan_tci: u16,
}

struct DummyFlow {
    flow: Flow,
    mask: Wildcards,
    actions: Vec<OdpAction>,
    stats: FlowStats,
}

struct Inner {
    name: String,
    ports: HashMap<OdpPort, String, ahash::RandomState>,
    ports_by_name: HashMap<String, OdpPort, ahash::RandomState>,
    next_port: u32,
    flows: HashMap<OdpFlowKey, DummyFlow, ahash::RandomState>,
    upcalls: VecDeque<Upcall>,
    sent: Vec<SentPacket>,
    n_executes: u64,
}

impl Inner {
    fn apply_actions(
        &mut self,
        key: &OdpFlowKey,
        packet: &Bytes,
        initial_tci: u16,
        actions: &[OdpAction],
    ) {
        let mut vlan_tci = initial_tci;
        self.apply_actions_inner(key, packet, &mut vlan_tci, actions);
    }

    fn apply_actions_inner(
        &mut self,
        key: &OdpFlowKey,
        packet: &Bytes,
        vlan_tci: &mut u16,
        actions: &[OdpAction],
    ) {
        for action in actions {
            match action {
                OdpAction::Output(port) => self.sent.push(SentPacket {
                    port: *port,
                    packet: packet.clone(),
                    vlan_tci: *vlan_tci,
                }),
                OdpAction::Userspace { cookie, .. } => self.upcalls.push_back(Upcall {
                    kind: UpcallKind::Action,
                    packet: packet.clone(),
                    key: key.clone(),
                    userdata: Some(*cookie),
                }),
                OdpAction::PushVlan { tci, .. } => *vlan_tci = *tci,
                OdpAction::PopVlan => *vlan_tci = 0,
                OdpAction::Sample {
                    probability,
                    actions,
                } => {
                    // Deterministic stand-in for the random draw: only
                    // always-sample fires.
                    if *probability == u32::MAX {
                        self.apply_actions_inner(key, packet, vlan_tci, actions);
                    }
                }
                OdpAction::Set(_) | OdpAction::PushMpls { .. } | OdpAction::PopMpls { .. } => {
                    // Header rewrites are not materialized into bytes; the
                    // tests observe them through the action lists instead.
                }
            }
        }
    }

    fn put(&mut self, put: FlowPut) -> OpResult {
        let (mut pflow, in_port, fitness) = key_to_flow(&put.key);
        if fitness != OdpFitness::Perfect {
            return Err(DpError::Invalid);
        }
        pflow.in_port = OfPort(in_port.0 as u16);
        let exists = self.flows.contains_key(&put.key);
        if exists && !put.flags.contains(PutFlags::MODIFY) {
            return Err(DpError::Exists);
        }
        if !exists && !put.flags.contains(PutFlags::CREATE) {
            return Err(DpError::NotFound);
        }
        let stats = match self.flows.get(&put.key) {
            Some(old) if !put.flags.contains(PutFlags::ZERO_STATS) => old.stats,
            _ => FlowStats::default(),
        };
        self.flows.insert(
            put.key,
            DummyFlow {
                flow: pflow,
                mask: put.mask.unwrap_or_else(Wildcards::exact),
                actions: put.actions,
                stats,
            },
        );
        Ok(None)
    }

    fn del(&mut self, key: &OdpFlowKey) -> OpResult {
        match self.flows.remove(key) {
            Some(f) => Ok(Some(f.stats)),
            None => Err(DpError::NotFound),
        }
    }

    fn forward(&mut self, port: OdpPort, packet: Bytes) {
        let mut pkt_flow = extract(&packet, &FlowMetadata::default());
        let key = flow_to_key(&pkt_flow, port);
        pkt_flow.in_port = OfPort(port.0 as u16);

        let hit = self
            .flows
            .iter()
            .find(|(_, f)| f.mask.flow_equal_except(&f.flow, &pkt_flow))
            .map(|(k, _)| k.clone());
        match hit {
            Some(flow_key) => {
                let (actions, initial_tci) = {
                    let f = self.flows.get_mut(&flow_key).unwrap_or_else(|| unreachable!());
                    f.stats.n_packets += 1;
                    f.stats.n_bytes += packet.len() as u64;
                    f.stats.used = Some(Instant::now());
                    f.stats.tcp_flags |= extract_tcp_flags(&packet);
                    (f.actions.clone(), pkt_flow.vlan_tci)
                };
                self.apply_actions(&key, &packet, initial_tci, &actions);
            }
            None => {
                debug!("dummy dpif {}: miss on port {port}", self.name);
                self.upcalls.push_back(Upcall {
                    kind: UpcallKind::Miss,
                    packet,
                    key,
                    userdata: None,
                });
            }
        }
    }
}

/// The datapath half; hand this to the engine.
pub struct DummyDpif {
    name: String,
    inner: Rc<RefCell<Inner>>,
}

/// The test/operator half: inject packets, inspect installed flows and
/// emitted packets.
#[derive(Clone)]
pub struct DummyHandle {
    inner: Rc<RefCell<Inner>>,
}

impl DummyDpif {
    #[must_use]
    pub fn create(name: &str) -> DummyDpif {
        DummyDpif {
            name: name.to_string(),
            inner: Rc::new(RefCell::new(Inner {
                name: name.to_string(),
                ports: HashMap::with_hasher(map_hasher()),
                ports_by_name: HashMap::with_hasher(map_hasher()),
                next_port: 1,
                flows: HashMap::with_hasher(map_hasher()),
                upcalls: VecDeque::new(),
                sent: Vec::new(),
                n_executes: 0,
            })),
        }
    }

    #[must_use]
    pub fn handle(&self) -> DummyHandle {
        DummyHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl DummyHandle {
    /// Deliver a packet to the datapath on `port`: forwarded through an
    /// installed flow if one matches, otherwise queued as a MISS upcall.
    pub fn inject(&self, port: OdpPort, packet: &[u8]) {
        self.inner
            .borrow_mut()
            .forward(port, Bytes::copy_from_slice(packet));
    }

    /// Queue a raw upcall, bypassing the flow table (for malformed-cookie
    /// and vanished-port cases).
    pub fn inject_upcall(&self, upcall: Upcall) {
        self.inner.borrow_mut().upcalls.push_back(upcall);
    }

    /// Drain the packets output so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut self.inner.borrow_mut().sent)
    }

    #[must_use]
    pub fn flows(&self) -> Vec<DpFlowEntry> {
        self.inner
            .borrow()
            .flows
            .iter()
            .map(|(k, f)| DpFlowEntry {
                key: k.clone(),
                mask: Some(f.mask),
                actions: f.actions.clone(),
                stats: f.stats,
            })
            .collect()
    }

    #[must_use]
    pub fn n_flows(&self) -> usize {
        self.inner.borrow().flows.len()
    }

    #[must_use]
    pub fn contains_flow(&self, key: &OdpFlowKey) -> bool {
        self.inner.borrow().flows.contains_key(key)
    }

    #[must_use]
    pub fn n_executes(&self) -> u64 {
        self.inner.borrow().n_executes
    }

    #[must_use]
    pub fn pending_upcalls(&self) -> usize {
        self.inner.borrow().upcalls.len()
    }

    /// Backdate a flow's `used` timestamp, for expiration tests.
    pub fn set_flow_used(&self, key: &OdpFlowKey, used: Instant) {
        if let Some(f) = self.inner.borrow_mut().flows.get_mut(key) {
            f.stats.used = Some(used);
        }
    }
}

impl Dpif for DummyDpif {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_add(&mut self, name: &str) -> Result<OdpPort, DpError> {
        let mut inner = self.inner.borrow_mut();
        if inner.ports_by_name.contains_key(name) {
            return Err(DpError::Exists);
        }
        let port = OdpPort(inner.next_port);
        inner.next_port += 1;
        inner.ports.insert(port, name.to_string());
        inner.ports_by_name.insert(name.to_string(), port);
        Ok(port)
    }

    fn port_del(&mut self, port: OdpPort) -> Result<(), DpError> {
        let mut inner = self.inner.borrow_mut();
        match inner.ports.remove(&port) {
            Some(name) => {
                inner.ports_by_name.remove(&name);
                Ok(())
            }
            None => Err(DpError::NoDevice),
        }
    }

    fn port_name(&self, port: OdpPort) -> Option<String> {
        self.inner.borrow().ports.get(&port).cloned()
    }

    fn port_dump(&self) -> Vec<(OdpPort, String)> {
        let mut ports: Vec<(OdpPort, String)> = self
            .inner
            .borrow()
            .ports
            .iter()
            .map(|(p, n)| (*p, n.clone()))
            .collect();
        ports.sort_by_key(|(p, _)| *p);
        ports
    }

    fn queue_to_priority(&self, queue_id: u32) -> Result<u32, DpError> {
        Ok(queue_id)
    }

    fn recv(&mut self) -> Result<Option<Upcall>, DpError> {
        Ok(self.inner.borrow_mut().upcalls.pop_front())
    }

    fn operate(&mut self, ops: Vec<DpOp>) -> Vec<OpResult> {
        let mut inner = self.inner.borrow_mut();
        ops.into_iter()
            .map(|op| match op {
                DpOp::FlowPut(put) => inner.put(put),
                DpOp::FlowDel(del) => inner.del(&del.key),
                DpOp::Execute(exec) => {
                    inner.n_executes += 1;
                    let (pflow, _, _) = key_to_flow(&exec.key);
                    inner.apply_actions(&exec.key, &exec.packet, pflow.vlan_tci, &exec.actions);
                    Ok(None)
                }
            })
            .collect()
    }

    fn flow_dump(&mut self) -> Vec<DpFlowEntry> {
        self.inner
            .borrow()
            .flows
            .iter()
            .map(|(k, f)| DpFlowEntry {
                key: k.clone(),
                mask: Some(f.mask),
                actions: f.actions.clone(),
                stats: f.stats,
            })
            .collect()
    }

    fn flow_get(&self, key: &OdpFlowKey) -> Result<DpFlowEntry, DpError> {
        let inner = self.inner.borrow();
        match inner.flows.get(key) {
            Some(f) => Ok(DpFlowEntry {
                key: key.clone(),
                mask: Some(f.mask),
                actions: f.actions.clone(),
                stats: f.stats,
            }),
            None => Err(DpError::NotFound),
        }
    }

    fn flow_flush(&mut self) {
        self.inner.borrow_mut().flows.clear();
    }

    fn n_flows(&self) -> usize {
        self.inner.borrow().flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::{EthAddr, packets};
    use std::net::Ipv4Addr;

    const SRC: EthAddr = EthAddr([0xaa, 0, 0, 0, 0, 1]);
    const DST: EthAddr = EthAddr([0xaa, 0, 0, 0, 0, 2]);

    fn tcp_pkt() -> Vec<u8> {
        packets::ipv4_tcp(
            SRC,
            DST,
            None,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            1234,
            80,
            0x10,
        )
    }

    #[test]
    fn miss_then_install_then_hit() {
        let mut dp = DummyDpif::create("dp-test");
        let handle = dp.handle();
        let p1 = dp.port_add("p1").unwrap();
        let p2 = dp.port_add("p2").unwrap();

        handle.inject(p1, &tcp_pkt());
        let upcall = dp.recv().unwrap().unwrap();
        assert_eq!(upcall.kind, UpcallKind::Miss);

        // Install an exact flow forwarding to p2.
        let results = dp.operate(vec![DpOp::FlowPut(FlowPut {
            flags: PutFlags::CREATE,
            key: upcall.key.clone(),
            mask: None,
            actions: vec![OdpAction::Output(p2)],
        })]);
        assert_eq!(results, vec![Ok(None)]);

        handle.inject(p1, &tcp_pkt());
        assert!(dp.recv().unwrap().is_none());
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].port, p2);

        let flows = handle.flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].stats.n_packets, 1);
        assert_eq!(flows[0].stats.tcp_flags, 0x10);
    }

    #[test]
    fn masked_flow_matches_variants() {
        let mut dp = DummyDpif::create("dp-test");
        let handle = dp.handle();
        let p1 = dp.port_add("p1").unwrap();
        let p2 = dp.port_add("p2").unwrap();

        handle.inject(p1, &tcp_pkt());
        let upcall = dp.recv().unwrap().unwrap();

        // Wildcard everything but ingress and dst MAC.
        let mut wc = Wildcards::catchall();
        wc.masks.in_port = OfPort(u16::MAX);
        wc.masks.dl_dst = EthAddr::BROADCAST;
        dp.operate(vec![DpOp::FlowPut(FlowPut {
            flags: PutFlags::CREATE,
            key: upcall.key,
            mask: Some(wc),
            actions: vec![OdpAction::Output(p2)],
        })]);

        // Different L3/L4, same ingress and dst MAC: still a hit.
        let other = packets::ipv4_udp(
            EthAddr([0xbb, 0, 0, 0, 0, 7]),
            DST,
            None,
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(5, 6, 7, 8),
            53,
            53,
        );
        handle.inject(p1, &other);
        assert!(dp.recv().unwrap().is_none());
        assert_eq!(handle.take_sent().len(), 1);

        // Same packet on a different port: miss.
        handle.inject(p2, &other);
        assert!(dp.recv().unwrap().is_some());
    }

    #[test]
    fn put_flag_semantics() {
        let mut dp = DummyDpif::create("dp-test");
        let handle = dp.handle();
        let p1 = dp.port_add("p1").unwrap();
        handle.inject(p1, &tcp_pkt());
        let key = dp.recv().unwrap().unwrap().key;

        let create = |key: &OdpFlowKey, flags| {
            DpOp::FlowPut(FlowPut {
                flags,
                key: key.clone(),
                mask: None,
                actions: vec![],
            })
        };
        assert_eq!(
            dp.operate(vec![create(&key, PutFlags::MODIFY)]),
            vec![Err(DpError::NotFound)]
        );
        assert_eq!(dp.operate(vec![create(&key, PutFlags::CREATE)]), vec![Ok(None)]);
        assert_eq!(
            dp.operate(vec![create(&key, PutFlags::CREATE)]),
            vec![Err(DpError::Exists)]
        );
        assert_eq!(
            dp.operate(vec![create(&key, PutFlags::MODIFY)]),
            vec![Ok(None)]
        );
    }

    #[test]
    fn repeated_batches_converge() {
        let mut dp = DummyDpif::create("dp-test");
        let handle = dp.handle();
        let p1 = dp.port_add("p1").unwrap();
        let p2 = dp.port_add("p2").unwrap();
        handle.inject(p1, &tcp_pkt());
        let upcall = dp.recv().unwrap().unwrap();

        let batch = vec![
            DpOp::FlowPut(FlowPut {
                flags: PutFlags::CREATE | PutFlags::MODIFY,
                key: upcall.key.clone(),
                mask: None,
                actions: vec![OdpAction::Output(p2)],
            }),
            DpOp::Execute(crate::dpif::ExecuteOp {
                key: upcall.key,
                packet: upcall.packet,
                actions: vec![OdpAction::Output(p2)],
            }),
        ];
        let first = dp.operate(batch.clone());
        let second = dp.operate(batch);
        assert_eq!(first, second);
        // Same installed state either way; only the executions repeated.
        assert_eq!(dp.n_flows(), 1);
        assert_eq!(handle.n_executes(), 2);
        assert_eq!(handle.take_sent().len(), 2);
    }

    #[test]
    fn del_returns_final_stats() {
        let mut dp = DummyDpif::create("dp-test");
        let handle = dp.handle();
        let p1 = dp.port_add("p1").unwrap();
        let p2 = dp.port_add("p2").unwrap();
        handle.inject(p1, &tcp_pkt());
        let key = dp.recv().unwrap().unwrap().key;
        dp.operate(vec![DpOp::FlowPut(FlowPut {
            flags: PutFlags::CREATE,
            key: key.clone(),
            mask: None,
            actions: vec![OdpAction::Output(p2)],
        })]);
        handle.inject(p1, &tcp_pkt());
        handle.inject(p1, &tcp_pkt());
        let results = dp.operate(vec![DpOp::FlowDel(crate::dpif::FlowDel { key })]);
        match &results[0] {
            Ok(Some(stats)) => assert_eq!(stats.n_packets, 2),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(dp.n_flows(), 0);
    }
}

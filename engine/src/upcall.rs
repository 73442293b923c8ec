// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Upcall dispatch and miss handling.
//!
//! Each `run_fast` pass drains a batch of upcalls, routes samples to their
//! collectors, collapses misses with identical (bridge, flow) keys, and
//! turns the survivors into a single batched datapath call of installs and
//! packet executions. Per-op failures never abort the batch.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use datapath::{
    DpOp, ExecuteOp, FlowPut, OdpFitness, OdpFlowKey, OdpPort, PutFlags, Upcall, UpcallKind,
    UserspaceCookie, key_to_flow,
};
use flow::{Flow, extract_tcp_flags, map_hasher};

use crate::engine::Engine;
use crate::facet::{Facet, Governor, Subfacet, SubfacetPath};
use crate::xlate::{SlowPathReason, XlateIn, xlate_actions};

/// One deduplicated miss: every packet of the batch that parsed to the same
/// (bridge, flow) fingerprint.
struct FlowMiss {
    bridge: String,
    flow: Flow,
    key: OdpFlowKey,
    odp_in_port: OdpPort,
    fitness: OdpFitness,
    initial_tci: u16,
    packets: Vec<Bytes>,
}

/// What each submitted op needs after the batch returns.
enum OpTag {
    DropKey,
    Install {
        bridge: String,
        flow: Flow,
        key: OdpFlowKey,
    },
    Execute,
}

/// Drain and handle up to `max` upcalls from one backer. Returns the
/// number of upcalls consumed.
pub(crate) fn dispatch_upcalls(
    engine: &mut Engine,
    backer_name: &str,
    now: Instant,
    max: usize,
) -> usize {
    let mut upcalls = Vec::new();
    {
        let Some(backer) = engine.backers.get_mut(backer_name) else {
            return 0;
        };
        while upcalls.len() < max {
            match backer.dpif.recv() {
                Ok(Some(upcall)) => upcalls.push(upcall),
                Ok(None) | Err(datapath::DpError::Again) => break,
                Err(err) => {
                    warn!("backer {backer_name}: recv error: {err}");
                    break;
                }
            }
        }
    }
    if upcalls.is_empty() {
        return 0;
    }
    let n = upcalls.len();

    let mut misses: Vec<FlowMiss> = Vec::new();
    let mut miss_index: HashMap<(String, Flow), usize, ahash::RandomState> =
        HashMap::with_hasher(map_hasher());
    let mut ops: Vec<(OpTag, DpOp)> = Vec::new();

    for upcall in upcalls {
        match classify_upcall(&upcall) {
            UpcallClass::Miss => {
                defer_miss(engine, backer_name, upcall, &mut misses, &mut miss_index, &mut ops, now);
            }
            UpcallClass::Sflow(cookie) => {
                let (_, odp_in_port, _) = key_to_flow(&upcall.key);
                if let Some((bridge_name, _)) = lookup_ofport(engine, backer_name, odp_in_port) {
                    if let Some(agent) = engine
                        .bridges
                        .get_mut(&bridge_name)
                        .and_then(|b| b.sflow.as_mut())
                    {
                        agent.received(upcall.packet, odp_in_port, cookie);
                    }
                }
            }
            UpcallClass::Ipfix(cookie) => {
                let (_, odp_in_port, _) = key_to_flow(&upcall.key);
                if let Some((bridge_name, _)) = lookup_ofport(engine, backer_name, odp_in_port) {
                    if let Some(agent) = engine
                        .bridges
                        .get_mut(&bridge_name)
                        .and_then(|b| b.ipfix.as_mut())
                    {
                        agent.received(upcall.packet, cookie);
                    }
                }
            }
            UpcallClass::Bad => {
                if engine.upcall_rl.admit(now) {
                    warn!("backer {backer_name}: dropping upcall with unrecognized cookie");
                }
            }
        }
    }

    for miss in misses {
        handle_flow_miss(engine, backer_name, miss, &mut ops, now);
    }

    if !ops.is_empty() {
        let (tags, dp_ops): (Vec<OpTag>, Vec<DpOp>) = ops.into_iter().unzip();
        let results = match engine.backers.get_mut(backer_name) {
            Some(backer) => backer.dpif.operate(dp_ops),
            None => return n,
        };
        for (tag, result) in tags.into_iter().zip(results) {
            apply_op_result(engine, backer_name, tag, result, now);
        }
    }
    n
}

enum UpcallClass {
    Miss,
    Sflow(UserspaceCookie),
    Ipfix(UserspaceCookie),
    Bad,
}

/// Classify by upcall kind and cookie shape. Slow-path action upcalls are
/// misses in disguise: the flow is installed but every packet still needs
/// full userspace handling.
fn classify_upcall(upcall: &Upcall) -> UpcallClass {
    match upcall.kind {
        UpcallKind::Miss => UpcallClass::Miss,
        UpcallKind::Action => match upcall.userdata {
            Some(UserspaceCookie::SlowPath { .. }) => UpcallClass::Miss,
            Some(cookie @ UserspaceCookie::Sflow { .. }) => UpcallClass::Sflow(cookie),
            Some(cookie @ UserspaceCookie::FlowSample { .. })
            | Some(cookie @ UserspaceCookie::IpfixBridge) => UpcallClass::Ipfix(cookie),
            None => UpcallClass::Bad,
        },
    }
}

fn lookup_ofport(
    engine: &Engine,
    backer_name: &str,
    odp_port: OdpPort,
) -> Option<(String, flow::OfPort)> {
    engine
        .backers
        .get(backer_name)?
        .odp_to_ofport
        .get(&odp_port)
        .cloned()
}

/// Parse one miss upcall and fold it into the per-(bridge, flow) todo list.
fn defer_miss(
    engine: &mut Engine,
    backer_name: &str,
    upcall: Upcall,
    misses: &mut Vec<FlowMiss>,
    miss_index: &mut HashMap<(String, Flow), usize, ahash::RandomState>,
    ops: &mut Vec<(OpTag, DpOp)>,
    now: Instant,
) {
    let (mut flow, odp_in_port, fitness) = key_to_flow(&upcall.key);
    let Some((bridge_name, ofp)) = lookup_ofport(engine, backer_name, odp_in_port) else {
        // The ingress port vanished (the ENODEV case): install a drop for
        // this exact key so the datapath stops asking.
        let Some(backer) = engine.backers.get_mut(backer_name) else {
            return;
        };
        if backer.drop_keys.insert(upcall.key.clone()) {
            debug!("backer {backer_name}: installing drop for key on vanished port {odp_in_port}");
            ops.push((
                OpTag::DropKey,
                DpOp::FlowPut(FlowPut {
                    flags: PutFlags::CREATE | PutFlags::MODIFY,
                    key: upcall.key,
                    mask: None,
                    actions: Vec::new(),
                }),
            ));
        }
        return;
    };
    flow.in_port = ofp;
    let initial_tci = flow.vlan_tci;

    let index_key = (bridge_name.clone(), flow);
    match miss_index.get(&index_key) {
        Some(at) => misses[*at].packets.push(upcall.packet),
        None => {
            miss_index.insert(index_key, misses.len());
            misses.push(FlowMiss {
                bridge: bridge_name,
                flow,
                key: upcall.key,
                odp_in_port,
                fitness,
                initial_tci,
                packets: vec![upcall.packet],
            });
        }
    }
}

/// Should this miss get a facet? Below the eviction threshold, always.
/// Above it, the governor demands evidence the flow is not one-shot.
fn should_make_facet(engine: &mut Engine, backer_name: &str, miss_hash: u32, now: Instant) -> bool {
    let Some(backer) = engine.backers.get_mut(backer_name) else {
        return false;
    };
    let n_subfacets = backer.subfacet_index.len();
    if n_subfacets < backer.flow_eviction_threshold {
        if backer.governor.is_some() && n_subfacets <= backer.flow_eviction_threshold / 4 {
            debug!("backer {backer_name}: tearing down the admission governor");
            backer.governor = None;
        }
        if backer.governor.is_none() {
            return true;
        }
    }
    let governor = backer.governor.get_or_insert_with(|| Governor::new(now));
    governor.should_install(miss_hash, now)
}

fn handle_flow_miss(
    engine: &mut Engine,
    backer_name: &str,
    miss: FlowMiss,
    ops: &mut Vec<(OpTag, DpOp)>,
    now: Instant,
) {
    let n_packets = miss.packets.len() as u64;
    let facet_exists = engine
        .bridges
        .get(&miss.bridge)
        .is_some_and(|b| b.facets.contains_key(&miss.flow));
    let Some(bridge) = engine.bridges.get_mut(&miss.bridge) else {
        return;
    };
    if facet_exists {
        bridge.n_hit += n_packets;
        handle_miss_with_existing_facet(engine, backer_name, miss, ops, now);
        return;
    }
    bridge.n_missed += n_packets;

    // Translate once, with the first packet so packet-ins and learning see
    // real traffic.
    let xout = xlate_actions(
        engine,
        XlateIn {
            bridge: &miss.bridge,
            flow: miss.flow,
            initial_tci: miss.initial_tci,
            rule: None,
            packet: miss.packets.first().cloned(),
            may_learn: true,
            resubmit_stats: None,
        },
        now,
        None,
    );
    let rule_id = match xout.rule {
        Some(rule) => rule,
        None => match engine.bridges.get(&miss.bridge) {
            Some(bridge) => bridge.rule_lookup(&miss.flow, None, 0),
            None => return,
        },
    };

    let miss_hash = xout.wc.hash_flow(&miss.flow, 0);
    let admit = miss.fitness == OdpFitness::Perfect
        && xout.may_install
        && should_make_facet(engine, backer_name, miss_hash, now);

    if !admit {
        // No facet: execute the actions on each packet and credit the rule
        // directly; nothing is installed.
        let bytes: u64 = miss.packets.iter().map(|p| p.len() as u64).sum();
        if let Some(rule) = engine
            .bridges
            .get_mut(&miss.bridge)
            .and_then(|b| b.rules.rule_mut(rule_id))
        {
            rule.credit(n_packets, bytes, Some(now));
        }
        for packet in miss.packets {
            ops.push((
                OpTag::Execute,
                DpOp::Execute(ExecuteOp {
                    key: miss.key.clone(),
                    packet,
                    actions: xout.odp_actions.clone(),
                }),
            ));
        }
        return;
    }

    // Create the facet and its first subfacet, install, and forward the
    // waiting packets.
    let path = Subfacet::wanted_path(xout.slow);
    let mut facet = Facet::new(miss.flow, miss.initial_tci, rule_id, xout, now);
    facet.subfacets.push(Subfacet {
        key: miss.key.clone(),
        odp_in_port: miss.odp_in_port,
        path,
        dp_packet_count: 0,
        dp_byte_count: 0,
        used: now,
        created: now,
    });
    for packet in &miss.packets {
        facet.account_packet(packet.len(), extract_tcp_flags(packet), now);
    }
    let install_actions = facet.install_actions();
    let execute_actions = facet.xout.odp_actions.clone();
    let mask = facet.xout.wc;

    if let Some(bridge) = engine.bridges.get_mut(&miss.bridge) {
        if let Some(rule) = bridge.rules.rule_mut(rule_id) {
            rule.facet_flows.insert(miss.flow);
        }
        bridge.facets.insert(miss.flow, facet);
    }
    if let Some(backer) = engine.backers.get_mut(backer_name) {
        backer
            .subfacet_index
            .insert(miss.key.clone(), (miss.bridge.clone(), miss.flow));
        let count = backer.subfacet_index.len();
        backer.rates.note_add(count);
    }
    // The packets handled here never touch the datapath counters, so their
    // stats go straight up to the rule / NetFlow / mirrors. Learning
    // already ran in the translation above.
    crate::facet::facet_push_stats(engine, &miss.bridge, &miss.flow, false, now);

    ops.push((
        OpTag::Install {
            bridge: miss.bridge.clone(),
            flow: miss.flow,
            key: miss.key.clone(),
        },
        DpOp::FlowPut(FlowPut {
            flags: PutFlags::CREATE | PutFlags::MODIFY | PutFlags::ZERO_STATS,
            key: miss.key.clone(),
            mask: Some(mask),
            actions: install_actions,
        }),
    ));
    for packet in miss.packets {
        ops.push((
            OpTag::Execute,
            DpOp::Execute(ExecuteOp {
                key: miss.key.clone(),
                packet,
                actions: execute_actions.clone(),
            }),
        ));
    }
}

/// A miss for a flow we already have a facet for: either a slow-path flow
/// whose every packet comes here, or a new datapath key variant of the
/// facet (a split).
fn handle_miss_with_existing_facet(
    engine: &mut Engine,
    backer_name: &str,
    miss: FlowMiss,
    ops: &mut Vec<(OpTag, DpOp)>,
    now: Instant,
) {
    let (slow, rule_id, initial_tci, facet_actions, install_actions, mask, has_key) = {
        let Some(facet) = engine
            .bridges
            .get(&miss.bridge)
            .and_then(|b| b.facets.get(&miss.flow))
        else {
            return;
        };
        (
            facet.xout.slow,
            facet.rule,
            facet.initial_tci,
            facet.xout.odp_actions.clone(),
            facet.install_actions(),
            facet.xout.wc,
            facet.subfacets.iter().any(|s| s.key == miss.key),
        )
    };

    // Controller-bound slow path: every packet wants its packet-in and
    // side effects, so re-translate per packet.
    let execute_actions = if slow.contains(SlowPathReason::CONTROLLER) {
        let mut actions = facet_actions;
        for packet in &miss.packets {
            let xout = xlate_actions(
                engine,
                XlateIn {
                    bridge: &miss.bridge,
                    flow: miss.flow,
                    initial_tci,
                    rule: Some(rule_id),
                    packet: Some(packet.clone()),
                    may_learn: true,
                    resubmit_stats: None,
                },
                now,
                None,
            );
            actions = xout.odp_actions;
        }
        actions
    } else {
        facet_actions
    };

    if let Some(facet) = engine
        .bridges
        .get_mut(&miss.bridge)
        .and_then(|b| b.facets.get_mut(&miss.flow))
    {
        for packet in &miss.packets {
            facet.account_packet(packet.len(), extract_tcp_flags(packet), now);
        }
        if !has_key && miss.fitness == OdpFitness::Perfect {
            // The datapath key space is finer than our wildcards: a second
            // subfacet under the same facet.
            facet.subfacets.push(Subfacet {
                key: miss.key.clone(),
                odp_in_port: miss.odp_in_port,
                path: Subfacet::wanted_path(slow),
                dp_packet_count: 0,
                dp_byte_count: 0,
                used: now,
                created: now,
            });
        }
    }
    crate::facet::facet_push_stats(engine, &miss.bridge, &miss.flow, false, now);
    if !has_key && miss.fitness == OdpFitness::Perfect {
        if let Some(backer) = engine.backers.get_mut(backer_name) {
            backer
                .subfacet_index
                .insert(miss.key.clone(), (miss.bridge.clone(), miss.flow));
            let count = backer.subfacet_index.len();
            backer.rates.note_add(count);
        }
        ops.push((
            OpTag::Install {
                bridge: miss.bridge.clone(),
                flow: miss.flow,
                key: miss.key.clone(),
            },
            DpOp::FlowPut(FlowPut {
                flags: PutFlags::CREATE | PutFlags::MODIFY | PutFlags::ZERO_STATS,
                key: miss.key.clone(),
                mask: Some(mask),
                actions: install_actions,
            }),
        ));
    }
    for packet in miss.packets {
        ops.push((
            OpTag::Execute,
            DpOp::Execute(ExecuteOp {
                key: miss.key.clone(),
                packet,
                actions: execute_actions.clone(),
            }),
        ));
    }
}

/// Post-batch bookkeeping: a failed install leaves its subfacet
/// `NotInstalled` with cleared datapath counters.
fn apply_op_result(
    engine: &mut Engine,
    _backer_name: &str,
    tag: OpTag,
    result: datapath::OpResult,
    now: Instant,
) {
    match tag {
        OpTag::DropKey | OpTag::Execute => {
            if let Err(err) = result {
                if engine.upcall_rl.admit(now) {
                    warn!("datapath op failed: {err}");
                }
            }
        }
        OpTag::Install { bridge, flow, key } => {
            let Some(facet) = engine
                .bridges
                .get_mut(&bridge)
                .and_then(|b| b.facets.get_mut(&flow))
            else {
                return;
            };
            let slow = facet.xout.slow;
            let Some(subfacet) = facet.subfacet_mut(&key) else {
                return;
            };
            match result {
                Ok(_) => subfacet.path = Subfacet::wanted_path(slow),
                Err(err) => {
                    subfacet.path = SubfacetPath::NotInstalled;
                    subfacet.dp_packet_count = 0;
                    subfacet.dp_byte_count = 0;
                    if engine.upcall_rl.admit(now) {
                        warn!("flow install failed on bridge {bridge}: {err}");
                    }
                }
            }
        }
    }
}

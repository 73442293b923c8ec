// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Expiration: idle subfacets and timed-out rules.
//!
//! The idle cutoff is adaptive. Under the eviction threshold everything
//! gets the full [`DP_MAX_IDLE`]; above it a histogram of idle ages picks
//! the smallest cutoff that keeps the datapath flow table near the
//! threshold. Protected control protocols (CFM/LACP/STP slow path) keep a
//! fixed long cutoff regardless of pressure.

use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::debug;

use datapath::{DpOp, FlowDel, OdpFlowKey};
use flow::Flow;
use openflow::{RuleId, RuleKind};

use crate::engine::Engine;
use crate::facet::{SubfacetPath, facet_push_stats, facet_remove};

/// Idle cutoff when the datapath flow table is under no pressure.
pub const DP_MAX_IDLE: Duration = Duration::from_millis(5000);
/// Idle cutoff for CFM/LACP/STP slow-path subfacets.
pub const SPECIAL_CUTOFF: Duration = Duration::from_millis(10_000);
/// Histogram bucket width.
pub const BUCKET_WIDTH: Duration = Duration::from_millis(100);
/// Histogram bucket count.
pub const N_BUCKETS: usize = 50;
/// Subfacets deleted per batched datapath call.
pub const SUBFACET_DESTROY_MAX_BATCH: usize = 50;

type Doomed = (String, Flow, OdpFlowKey);

/// One expiration pass over a backer.
pub(crate) fn expire(engine: &mut Engine, backer_name: &str, now: Instant) {
    let max_idle = subfacet_max_idle(engine, backer_name, now);

    let bridge_names: Vec<String> = engine
        .bridges
        .iter()
        .filter(|(_, b)| b.backer == backer_name)
        .map(|(name, _)| name.clone())
        .collect();

    // Collect subfacets past their cutoff.
    let mut doomed: Vec<Doomed> = Vec::new();
    for bridge_name in &bridge_names {
        let Some(bridge) = engine.bridges.get(bridge_name) else {
            continue;
        };
        for facet in bridge.facets.values() {
            let cutoff = if facet.xout.slow.is_protected_protocol() {
                SPECIAL_CUTOFF
            } else {
                max_idle
            };
            for subfacet in &facet.subfacets {
                if now.saturating_duration_since(subfacet.used) > cutoff {
                    doomed.push((bridge_name.clone(), facet.flow, subfacet.key.clone()));
                }
            }
        }
    }
    if !doomed.is_empty() {
        debug!(
            "backer {backer_name}: expiring {} subfacet(s), cutoff {max_idle:?}",
            doomed.len()
        );
    }

    let mut batch: ArrayVec<Doomed, SUBFACET_DESTROY_MAX_BATCH> = ArrayVec::new();
    for item in doomed {
        if batch.is_full() {
            expire_subfacet_batch(engine, backer_name, &batch, now);
            batch.clear();
        }
        batch.push(item);
    }
    if !batch.is_empty() {
        expire_subfacet_batch(engine, backer_name, &batch, now);
    }

    expire_rules(engine, &bridge_names, now);
}

/// Histogram-driven idle cutoff for ordinary subfacets.
fn subfacet_max_idle(engine: &Engine, backer_name: &str, now: Instant) -> Duration {
    let Some(backer) = engine.backers.get(backer_name) else {
        return DP_MAX_IDLE;
    };
    let total = backer.subfacet_index.len();
    if total <= backer.flow_eviction_threshold {
        return DP_MAX_IDLE;
    }

    let mut buckets = [0usize; N_BUCKETS];
    for bridge in engine.bridges.values().filter(|b| b.backer == backer_name) {
        for facet in bridge.facets.values() {
            for subfacet in &facet.subfacets {
                let idle = now.saturating_duration_since(subfacet.used);
                let at = ((idle.as_millis() / BUCKET_WIDTH.as_millis()) as usize).min(N_BUCKETS - 1);
                buckets[at] += 1;
            }
        }
    }

    // Smallest cutoff whose tail (everything at least that idle) fits the
    // allowance; those tail subfacets are the ones expired.
    let allowed = backer.flow_eviction_threshold.max(total / 100);
    let mut tail = total;
    for (i, count) in buckets.iter().enumerate() {
        if tail <= allowed {
            return BUCKET_WIDTH * i as u32;
        }
        tail -= count;
    }
    BUCKET_WIDTH * N_BUCKETS as u32
}

/// Delete one batch of subfacets from the datapath, folding their final
/// counters into their facets; facets left empty die with them.
fn expire_subfacet_batch(engine: &mut Engine, backer_name: &str, batch: &[Doomed], now: Instant) {
    // One datapath call for the installed ones.
    let installed: Vec<&Doomed> = batch
        .iter()
        .filter(|(bridge, flow, key)| {
            engine
                .bridges
                .get(bridge)
                .and_then(|b| b.facets.get(flow))
                .and_then(|f| f.subfacets.iter().find(|s| s.key == *key))
                .is_some_and(|s| s.path != SubfacetPath::NotInstalled)
        })
        .collect();
    let results = match engine.backers.get_mut(backer_name) {
        Some(backer) => {
            let ops: Vec<DpOp> = installed
                .iter()
                .map(|(_, _, key)| DpOp::FlowDel(FlowDel { key: key.clone() }))
                .collect();
            backer.dpif.operate(ops)
        }
        None => return,
    };
    let installed: Vec<Doomed> = installed.into_iter().cloned().collect();
    for ((bridge_name, flow, key), result) in installed.iter().zip(results) {
        if let Ok(Some(stats)) = result {
            if let Some(facet) = engine
                .bridges
                .get_mut(bridge_name)
                .and_then(|b| b.facets.get_mut(flow))
            {
                if let Some(subfacet) = facet.subfacet_mut(key) {
                    let dp = stats.n_packets.saturating_sub(subfacet.dp_packet_count);
                    let db = stats.n_bytes.saturating_sub(subfacet.dp_byte_count);
                    subfacet.dp_packet_count = stats.n_packets;
                    subfacet.dp_byte_count = stats.n_bytes;
                    facet.packet_count += dp;
                    facet.byte_count += db;
                    facet.tcp_flags |= stats.tcp_flags;
                    if let Some(used) = stats.used {
                        facet.used = Some(facet.used.map_or(used, |u| u.max(used)));
                    }
                }
            }
        }
    }

    // Unlink the subfacets; collect facets that lost their last one.
    let mut emptied: Vec<(String, Flow)> = Vec::new();
    let mut touched: Vec<(String, Flow)> = Vec::new();
    for (bridge_name, flow, key) in batch {
        if let Some(backer) = engine.backers.get_mut(backer_name) {
            backer.subfacet_index.remove(key);
        }
        let Some(facet) = engine
            .bridges
            .get_mut(bridge_name)
            .and_then(|b| b.facets.get_mut(flow))
        else {
            continue;
        };
        if let Some(at) = facet.subfacets.iter().position(|s| s.key == *key) {
            let subfacet = facet.subfacets.remove(at);
            if let Some(backer) = engine.backers.get_mut(backer_name) {
                backer
                    .rates
                    .note_del(now.saturating_duration_since(subfacet.created));
            }
        }
        let pair = (bridge_name.clone(), *flow);
        if facet.subfacets.is_empty() {
            if !emptied.contains(&pair) {
                emptied.push(pair);
            }
        } else if !touched.contains(&pair) {
            touched.push(pair);
        }
    }

    for (bridge_name, flow) in touched {
        facet_push_stats(engine, &bridge_name, &flow, false, now);
    }
    for (bridge_name, flow) in emptied {
        facet_remove(engine, &bridge_name, &flow, now);
    }
}

/// Remove rules past their idle or hard timeout, destroying their facets.
fn expire_rules(engine: &mut Engine, bridge_names: &[String], now: Instant) {
    for bridge_name in bridge_names {
        let expired: Vec<RuleId> = {
            let Some(bridge) = engine.bridges.get(bridge_name) else {
                continue;
            };
            bridge
                .rules
                .rules()
                .filter(|r| r.kind == RuleKind::Normal && r.is_expired(now))
                .map(|r| r.id)
                .collect()
        };
        for id in expired {
            // Facets fold their final counters into the rule, so they must
            // go while the rule is still in the arena.
            let flows: Vec<Flow> = engine
                .bridges
                .get(bridge_name)
                .and_then(|b| b.rules.rule(id))
                .map(|r| r.facet_flows.iter().copied().collect())
                .unwrap_or_default();
            for flow in &flows {
                facet_remove(engine, bridge_name, flow, now);
            }
            let Some(bridge) = engine.bridges.get_mut(bridge_name) else {
                continue;
            };
            let backer_name = bridge.backer.clone();
            let Some((_rule, scope)) = bridge.rules.remove_rule(id) else {
                continue;
            };
            debug!("bridge {bridge_name}: rule {id:?} expired ({} facets)", flows.len());
            engine.mark_revalidate_scope(&backer_name, scope);
        }
    }
}

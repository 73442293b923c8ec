// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Revalidation: bring facets back in line with changed state.
//!
//! Config changes set a backer-wide reason; narrow changes (a flow mod in a
//! taggable table, a moved MAC) contribute tags. A pass re-translates the
//! affected facets: a changed rule moves the facet, changed actions
//! re-install its subfacets, and anything deeper (wildcards or slow-path
//! change) destroys it rather than migrate it.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, info};

use datapath::{DpOp, FlowPut, PutFlags};
use flow::Flow;

use crate::engine::{Engine, RevalReason};
use crate::facet::{SubfacetPath, facet_check_consistency, facet_remove};
use crate::xlate::{XlateIn, xlate_actions};

/// Facets examined between `run_fast_rl` gates.
const REVAL_CHUNK: usize = 100;

pub(crate) fn revalidate(engine: &mut Engine, backer_name: &str, now: Instant) {
    let (reason, tags) = {
        let Some(backer) = engine.backers.get_mut(backer_name) else {
            return;
        };
        let reason = backer.need_revalidate.take();
        let tags = std::mem::take(&mut backer.revalidate_set);
        (reason, tags)
    };
    if reason.is_none() && tags.is_empty() {
        return;
    }
    let full = reason.is_some();
    if let Some(reason) = reason {
        info!("backer {backer_name}: full revalidation ({reason:?})");
    } else {
        debug!("backer {backer_name}: tag-based revalidation");
    }

    let bridge_names: Vec<String> = engine
        .bridges
        .iter()
        .filter(|(_, b)| b.backer == backer_name)
        .map(|(name, _)| name.clone())
        .collect();
    for bridge_name in bridge_names {
        let facet_flows: Vec<Flow> = {
            let Some(bridge) = engine.bridges.get(&bridge_name) else {
                continue;
            };
            bridge
                .facets
                .iter()
                .filter(|(_, facet)| full || facet.xout.tags.intersects(tags))
                .map(|(flow, _)| *flow)
                .collect()
        };
        for (i, flow) in facet_flows.iter().enumerate() {
            if i % REVAL_CHUNK == 0 && i != 0 {
                // Keep miss handling alive through a big pass.
                engine.run_fast_rl(now);
            }
            facet_revalidate(engine, &bridge_name, flow, now);
        }
    }
}

/// Re-translate one facet against current state.
fn facet_revalidate(engine: &mut Engine, bridge_name: &str, facet_flow: &Flow, now: Instant) {
    let Some(bridge) = engine.bridges.get(bridge_name) else {
        return;
    };
    let Some(facet) = bridge.facets.get(facet_flow) else {
        return;
    };
    let old_rule = facet.rule;
    let old_wc = facet.xout.wc;
    let old_slow = facet.xout.slow;
    let old_actions = facet.xout.odp_actions.clone();
    let initial_tci = facet.initial_tci;
    let backer_name = bridge.backer.clone();

    let new_rule = bridge.rule_lookup(facet_flow, None, 0);
    let xout = xlate_actions(
        engine,
        XlateIn {
            bridge: bridge_name,
            flow: *facet_flow,
            initial_tci,
            rule: Some(new_rule),
            packet: None,
            may_learn: false,
            resubmit_stats: None,
        },
        now,
        None,
    );

    // A facet whose match shape or slow-path classification changed cannot
    // be migrated in place.
    if xout.wc != old_wc || xout.slow != old_slow {
        debug!("bridge {bridge_name}: facet shape changed; destroying");
        facet_remove(engine, bridge_name, facet_flow, now);
        return;
    }

    let actions_changed = xout.odp_actions != old_actions;
    let Some(bridge) = engine.bridges.get_mut(bridge_name) else {
        return;
    };
    if new_rule != old_rule {
        if let Some(rule) = bridge.rules.rule_mut(old_rule) {
            rule.facet_flows.remove(facet_flow);
        }
        if let Some(rule) = bridge.rules.rule_mut(new_rule) {
            rule.facet_flows.insert(*facet_flow);
        }
    }
    let Some(facet) = bridge.facets.get_mut(facet_flow) else {
        return;
    };
    facet.rule = new_rule;
    facet.xout = xout;

    if actions_changed {
        let install_actions = facet.install_actions();
        let mask = facet.xout.wc;
        let ops: Vec<DpOp> = facet
            .subfacets
            .iter()
            .filter(|s| s.path != SubfacetPath::NotInstalled)
            .map(|s| {
                DpOp::FlowPut(FlowPut {
                    flags: PutFlags::CREATE | PutFlags::MODIFY,
                    key: s.key.clone(),
                    mask: Some(mask),
                    actions: install_actions.clone(),
                })
            })
            .collect();
        if let Some(backer) = engine.backers.get_mut(&backer_name) {
            backer.dpif.operate(ops);
        }
    }
}

/// Spot-check one random facet per pass; an inconsistency forces a full
/// revalidation next time around.
pub(crate) fn random_consistency_check(engine: &mut Engine, backer_name: &str, now: Instant) {
    let candidates: Vec<(String, Flow)> = engine
        .bridges
        .iter()
        .filter(|(_, b)| b.backer == backer_name)
        .flat_map(|(name, b)| b.facets.keys().map(move |f| (name.clone(), *f)))
        .collect();
    if candidates.is_empty() {
        return;
    }
    let (bridge_name, flow) = candidates[rand::rng().random_range(0..candidates.len())].clone();
    if !facet_check_consistency(engine, &bridge_name, &flow, now) {
        if let Some(backer) = engine.backers.get_mut(backer_name) {
            backer.mark_revalidate(RevalReason::Inconsistency);
        }
    }
}

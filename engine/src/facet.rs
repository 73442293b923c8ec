// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The facet / subfacet cache.
//!
//! A facet is the userspace cache entry for one exact-match flow
//! fingerprint: the translated actions, the wildcards discovered while
//! translating, and aggregate counters. Its subfacets are the concrete
//! datapath installations, one per datapath key variant. Stats flow
//! upward: datapath → subfacet → facet → rule / NetFlow / mirrors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use datapath::{DpOp, FlowDel, FlowStats, OdpAction, OdpFlowKey, OdpPort};
use flow::{Flow, map_hasher};
use openflow::RuleId;

use crate::engine::Engine;
use crate::xlate::{ResubmitStats, SlowPathReason, XlateIn, XlateOut, xlate_actions};

/// Installation state of a subfacet's datapath flow.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubfacetPath {
    /// No datapath flow (never installed, or the install failed).
    NotInstalled,
    /// Installed with the translated actions.
    Fast,
    /// Installed with a single send-to-userspace action.
    Slow,
}

/// One datapath-key variant of a facet.
#[derive(Clone, Debug)]
pub struct Subfacet {
    pub key: OdpFlowKey,
    pub odp_in_port: OdpPort,
    pub path: SubfacetPath,
    /// Last counters observed from the datapath, for delta computation.
    pub dp_packet_count: u64,
    pub dp_byte_count: u64,
    pub used: Instant,
    pub created: Instant,
}

impl Subfacet {
    /// The path this subfacet should be on given its facet's translation.
    #[must_use]
    pub fn wanted_path(slow: SlowPathReason) -> SubfacetPath {
        if slow.is_empty() {
            SubfacetPath::Fast
        } else {
            SubfacetPath::Slow
        }
    }
}

/// A userspace cache entry for one exact flow fingerprint.
#[derive(Debug)]
pub struct Facet {
    pub flow: Flow,
    /// VLAN TCI the packet arrived with (before ingress rewrites).
    pub initial_tci: u16,
    pub rule: RuleId,
    pub xout: XlateOut,
    pub packet_count: u64,
    pub byte_count: u64,
    pub prev_packet_count: u64,
    pub prev_byte_count: u64,
    pub used: Option<Instant>,
    pub prev_used: Option<Instant>,
    pub tcp_flags: u8,
    pub created: Instant,
    pub subfacets: Vec<Subfacet>,
}

impl Facet {
    #[must_use]
    pub fn new(flow: Flow, initial_tci: u16, rule: RuleId, xout: XlateOut, now: Instant) -> Facet {
        Facet {
            flow,
            initial_tci,
            rule,
            xout,
            packet_count: 0,
            byte_count: 0,
            prev_packet_count: 0,
            prev_byte_count: 0,
            used: None,
            prev_used: None,
            tcp_flags: 0,
            created: now,
            subfacets: Vec::with_capacity(1),
        }
    }

    pub fn subfacet_mut(&mut self, key: &OdpFlowKey) -> Option<&mut Subfacet> {
        self.subfacets.iter_mut().find(|s| s.key == *key)
    }

    /// The actions a subfacet of this facet installs.
    #[must_use]
    pub fn install_actions(&self) -> Vec<OdpAction> {
        if self.xout.slow.is_empty() {
            self.xout.odp_actions.clone()
        } else {
            OdpAction::slow_path(0, self.xout.slow.bits())
        }
    }

    /// Record traffic handled in userspace (miss packets executed directly).
    pub fn account_packet(&mut self, bytes: usize, tcp_flags: u8, now: Instant) {
        self.packet_count += 1;
        self.byte_count += bytes as u64;
        self.tcp_flags |= tcp_flags;
        self.used = Some(match self.used {
            Some(prev) => prev.max(now),
            None => now,
        });
    }
}

/// Cache-admission governor.
///
/// Instantiated only under datapath-flow pressure: each miss is hashed by
/// its masked flow and must show up twice within the decay window before a
/// facet is worth installing for it.
pub struct Governor {
    table: HashMap<u32, u8, ahash::RandomState>,
    started: Instant,
}

const GOVERNOR_DECAY: Duration = Duration::from_secs(30);

impl Governor {
    #[must_use]
    pub fn new(now: Instant) -> Governor {
        debug!("instantiating cache-admission governor");
        Governor {
            table: HashMap::with_hasher(map_hasher()),
            started: now,
        }
    }

    pub fn should_install(&mut self, hash: u32, now: Instant) -> bool {
        if now.duration_since(self.started) > GOVERNOR_DECAY {
            self.table.clear();
            self.started = now;
        }
        let count = self.table.entry(hash).or_insert(0);
        *count = count.saturating_add(1);
        *count >= 2
    }
}

/// Pull datapath counters and fold them up. Unknown datapath flows are
/// deleted; shrinking counters are clamped and logged.
pub(crate) fn update_stats(engine: &mut Engine, backer_name: &str, now: Instant) {
    let entries = match engine.backers.get_mut(backer_name) {
        Some(b) => b.dpif.flow_dump(),
        None => return,
    };
    let mut unknown: Vec<OdpFlowKey> = Vec::new();
    let mut touched: Vec<(String, Flow)> = Vec::new();

    for entry in entries {
        let Some(backer) = engine.backers.get(backer_name) else {
            return;
        };
        if backer.drop_keys.contains(&entry.key) {
            continue;
        }
        let Some((bridge_name, facet_flow)) = backer.subfacet_index.get(&entry.key).cloned()
        else {
            unknown.push(entry.key);
            continue;
        };
        let Some(facet) = engine
            .bridges
            .get_mut(&bridge_name)
            .and_then(|b| b.facets.get_mut(&facet_flow))
        else {
            unknown.push(entry.key);
            continue;
        };
        let Some(subfacet) = facet.subfacet_mut(&entry.key) else {
            unknown.push(entry.key);
            continue;
        };

        let stats = entry.stats;
        let (dp, db) = subfacet_fold_stats(subfacet, &stats, &mut engine.stats_rl, now);
        if let Some(used) = stats.used {
            subfacet.used = subfacet.used.max(used);
        }
        if dp > 0 || db > 0 || stats.used.is_some() {
            facet.packet_count += dp;
            facet.byte_count += db;
            facet.tcp_flags |= stats.tcp_flags;
            if let Some(used) = stats.used {
                facet.used = Some(facet.used.map_or(used, |u| u.max(used)));
            }
            if !touched.iter().any(|(b, f)| b == &bridge_name && f == &facet_flow) {
                touched.push((bridge_name.clone(), facet_flow));
            }
        }
    }

    if !unknown.is_empty() {
        if engine.stats_rl.admit(now) {
            warn!(
                "{} unexpected flows in datapath {backer_name}; deleting",
                unknown.len()
            );
        }
        let ops: Vec<DpOp> = unknown
            .into_iter()
            .map(|key| DpOp::FlowDel(FlowDel { key }))
            .collect();
        if let Some(backer) = engine.backers.get_mut(backer_name) {
            backer.dpif.operate(ops);
        }
    }

    for (bridge_name, facet_flow) in touched {
        facet_push_stats(engine, &bridge_name, &facet_flow, true, now);
    }

    if let Some(backer) = engine.backers.get_mut(backer_name) {
        backer.rates.n_update_stats += 1;
        backer.rates.roll(now);
    }
}

/// Fold one datapath counter observation into a subfacet, returning the
/// packet/byte delta. A datapath that reports less than we have seen is
/// either restarting or broken; clamp to zero rather than credit negative
/// traffic.
fn subfacet_fold_stats(
    subfacet: &mut Subfacet,
    stats: &FlowStats,
    rl: &mut crate::util::RateLimit,
    now: Instant,
) -> (u64, u64) {
    let dp = if stats.n_packets >= subfacet.dp_packet_count {
        stats.n_packets - subfacet.dp_packet_count
    } else {
        if rl.admit(now) {
            warn!(
                "unexpected packet count from the datapath: {} < {}",
                stats.n_packets, subfacet.dp_packet_count
            );
        }
        0
    };
    let db = stats.n_bytes.saturating_sub(subfacet.dp_byte_count);
    subfacet.dp_packet_count = stats.n_packets;
    subfacet.dp_byte_count = stats.n_bytes;
    (dp, db)
}

/// Push a facet's accumulated deltas to its rule, NetFlow and mirrors,
/// re-running translation for side effects when the facet has learn /
/// normal / fin-timeout behavior to refresh.
pub(crate) fn facet_push_stats(
    engine: &mut Engine,
    bridge_name: &str,
    facet_flow: &Flow,
    may_learn: bool,
    now: Instant,
) {
    let Some(bridge) = engine.bridges.get_mut(bridge_name) else {
        return;
    };
    let Some(facet) = bridge.facets.get_mut(facet_flow) else {
        return;
    };
    let dp = facet.packet_count - facet.prev_packet_count;
    let db = facet.byte_count - facet.prev_byte_count;
    let used = facet.used;
    let newer_used = match (used, facet.prev_used) {
        (Some(u), Some(prev)) => u > prev,
        (Some(_), None) => true,
        _ => false,
    };
    if dp == 0 && db == 0 && !newer_used {
        return;
    }
    facet.prev_packet_count = facet.packet_count;
    facet.prev_byte_count = facet.byte_count;
    facet.prev_used = used;

    let rule_id = facet.rule;
    let initial_tci = facet.initial_tci;
    let tcp_flags = facet.tcp_flags;
    let needs_side_effects =
        facet.xout.has_learn || facet.xout.has_normal || facet.xout.has_fin_timeout;
    let nf_output = facet.xout.nf_output;
    let mirrors = facet.xout.mirrors;

    if let Some(rule) = bridge.rules.rule_mut(rule_id) {
        rule.credit(dp, db, used);
    }
    if let Some(nf) = bridge.netflow.as_mut() {
        nf.observe(facet_flow, nf_output, dp, db, used.unwrap_or(now));
    }
    bridge.credit_mirrors(mirrors, dp, db);

    if may_learn && needs_side_effects && dp > 0 {
        xlate_actions(
            engine,
            XlateIn {
                bridge: bridge_name,
                flow: *facet_flow,
                initial_tci,
                rule: Some(rule_id),
                packet: None,
                may_learn: true,
                resubmit_stats: Some(ResubmitStats {
                    packets: dp,
                    bytes: db,
                    tcp_flags,
                    used,
                }),
            },
            now,
            None,
        );
    }
}

/// Tear a facet down: uninstall its subfacets (folding their final
/// counters), push the final stats, and unlink it everywhere.
pub(crate) fn facet_remove(engine: &mut Engine, bridge_name: &str, facet_flow: &Flow, now: Instant) {
    let Some(bridge) = engine.bridges.get(bridge_name) else {
        return;
    };
    let backer_name = bridge.backer.clone();
    let Some(facet) = bridge.facets.get(facet_flow) else {
        return;
    };
    let installed: Vec<OdpFlowKey> = facet
        .subfacets
        .iter()
        .filter(|s| s.path != SubfacetPath::NotInstalled)
        .map(|s| s.key.clone())
        .collect();
    let all_keys: Vec<OdpFlowKey> = facet.subfacets.iter().map(|s| s.key.clone()).collect();

    // Final counters come back on the delete.
    let results = match engine.backers.get_mut(&backer_name) {
        Some(backer) => {
            let ops: Vec<DpOp> = installed
                .iter()
                .map(|key| DpOp::FlowDel(FlowDel { key: key.clone() }))
                .collect();
            backer.dpif.operate(ops)
        }
        None => Vec::new(),
    };
    if let Some(facet) = engine
        .bridges
        .get_mut(bridge_name)
        .and_then(|b| b.facets.get_mut(facet_flow))
    {
        for (key, result) in installed.iter().zip(results) {
            if let Ok(Some(stats)) = result {
                if let Some(subfacet) = facet.subfacet_mut(key) {
                    let (dp, db) =
                        subfacet_fold_stats(subfacet, &stats, &mut engine.stats_rl, now);
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

    facet_push_stats(engine, bridge_name, facet_flow, false, now);

    if let Some(backer) = engine.backers.get_mut(&backer_name) {
        for key in &all_keys {
            backer.subfacet_index.remove(key);
        }
    }
    if let Some(bridge) = engine.bridges.get_mut(bridge_name) {
        if let Some(facet) = bridge.facets.remove(facet_flow) {
            if let Some(rule) = bridge.rules.rule_mut(facet.rule) {
                rule.facet_flows.remove(facet_flow);
            }
            if let Some(nf) = bridge.netflow.as_mut() {
                nf.expire(facet_flow);
            }
            if let Some(backer) = engine.backers.get_mut(&backer_name) {
                for subfacet in &facet.subfacets {
                    backer
                        .rates
                        .note_del(now.saturating_duration_since(subfacet.created));
                }
            }
            debug!(
                "bridge {bridge_name}: removed facet with {} subfacet(s)",
                facet.subfacets.len()
            );
        }
    }
}

/// Re-translate a facet and compare against its stored state. A mismatch
/// means some dependency changed without marking revalidation.
pub(crate) fn facet_check_consistency(
    engine: &mut Engine,
    bridge_name: &str,
    facet_flow: &Flow,
    now: Instant,
) -> bool {
    let Some(bridge) = engine.bridges.get(bridge_name) else {
        return true;
    };
    let Some(facet) = bridge.facets.get(facet_flow) else {
        return true;
    };
    let stored_rule = facet.rule;
    let stored_actions = facet.xout.odp_actions.clone();
    let stored_slow = facet.xout.slow;
    let initial_tci = facet.initial_tci;

    let correct_rule = bridge.rule_lookup(facet_flow, None, 0);
    let xout = xlate_actions(
        engine,
        XlateIn {
            bridge: bridge_name,
            flow: *facet_flow,
            initial_tci,
            rule: Some(correct_rule),
            packet: None,
            may_learn: false,
            resubmit_stats: None,
        },
        now,
        None,
    );
    let ok =
        correct_rule == stored_rule && xout.odp_actions == stored_actions && xout.slow == stored_slow;
    if !ok {
        warn!("bridge {bridge_name}: facet inconsistency detected");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorMask;
    use crate::netflow::NfOutput;
    use crate::xlate::SlowPathReason;
    use openflow::TagSet;

    fn xout(slow: SlowPathReason) -> XlateOut {
        XlateOut {
            odp_actions: vec![OdpAction::Output(OdpPort(2))],
            wc: flow::Wildcards::exact(),
            tags: TagSet::default(),
            slow,
            has_learn: false,
            has_normal: false,
            has_fin_timeout: false,
            nf_output: NfOutput::Iface(2),
            mirrors: MirrorMask::default(),
            max_resubmit_triggered: false,
            rule: None,
            may_install: true,
        }
    }

    #[test]
    fn governor_requires_a_second_sighting() {
        let now = Instant::now();
        let mut g = Governor::new(now);
        assert!(!g.should_install(42, now));
        assert!(g.should_install(42, now));
        assert!(!g.should_install(43, now));
    }

    #[test]
    fn governor_decays() {
        let now = Instant::now();
        let mut g = Governor::new(now);
        assert!(!g.should_install(42, now));
        // Past the decay window the count starts over.
        let later = now + GOVERNOR_DECAY + Duration::from_secs(1);
        assert!(!g.should_install(42, later));
        assert!(g.should_install(42, later));
    }

    #[test]
    fn slow_facets_install_userspace_action() {
        let now = Instant::now();
        let fast = Facet::new(
            flow::Flow::default(),
            0,
            openflow::RuleId(1),
            xout(SlowPathReason::empty()),
            now,
        );
        assert_eq!(fast.install_actions(), fast.xout.odp_actions);

        let slow = Facet::new(
            flow::Flow::default(),
            0,
            openflow::RuleId(1),
            xout(SlowPathReason::LACP),
            now,
        );
        assert!(matches!(
            slow.install_actions().as_slice(),
            [OdpAction::Userspace { .. }]
        ));
        assert_eq!(
            Subfacet::wanted_path(SlowPathReason::LACP),
            SubfacetPath::Slow
        );
    }

    #[test]
    fn account_packet_accumulates() {
        let now = Instant::now();
        let mut facet = Facet::new(
            flow::Flow::default(),
            0,
            openflow::RuleId(1),
            xout(SlowPathReason::empty()),
            now,
        );
        facet.account_packet(100, 0x02, now);
        facet.account_packet(50, 0x10, now + Duration::from_secs(1));
        assert_eq!(facet.packet_count, 2);
        assert_eq!(facet.byte_count, 150);
        assert_eq!(facet.tcp_flags, 0x12);
        assert_eq!(facet.used, Some(now + Duration::from_secs(1)));
    }
}

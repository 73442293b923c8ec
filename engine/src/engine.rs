// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The engine: all bridges, all backers, the run drivers.
//!
//! Process-wide singletons of the classic implementation (the bridge and
//! backer registries, the megaflow and clog toggles) are fields of an
//! explicit [`Engine`] value instead; tests construct a fresh one per case.
//! Everything runs on one cooperative thread: `run()` is the slow path
//! (stats, revalidation, expiration, housekeeping), `run_fast()` the hot
//! path (upcall batches).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use derive_builder::Builder;
use tracing::{debug, info, warn};

use datapath::{DpError, Dpif, OdpFlowKey, OdpPort};
use flow::{Flow, OfPort, map_hasher};
use openflow::{FlowMod, RevalScope, RuleId, TableError, TagSet};

use crate::bridge::{Bridge, FragHandling};
use crate::bundle::{Bundle, BundleConfig};
use crate::facet::{Governor, facet_remove};
use crate::ipfix::{IpfixAgent, IpfixConfig};
use crate::mirror::{MAX_MIRRORS, Mirror, MirrorConfig, MirrorMask, update_dup_mirrors};
use crate::netflow::{NetFlow, NetFlowConfig};
use crate::port::{Port, PortSettings, StpState};
use crate::sflow::{SflowAgent, SflowConfig};
use crate::stats::SubfacetRates;
use crate::util::RateLimit;
use crate::xlate::{XlateIn, XlateOut, xlate_actions};

/// Largest upcall batch handled per `run_fast` call.
pub const MAX_BATCH: usize = 50;

/// Interval between datapath stats pulls.
pub const STATS_PULL_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between expiration passes.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Gate on re-entering `run_fast` from long slow-path loops.
pub const RUN_FAST_INTERVAL: Duration = Duration::from_millis(200);

/// Default subfacet count above which the admission governor engages.
pub const FLOW_EVICTION_THRESHOLD: usize = 1000;

/// Why a revalidation pass is needed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RevalReason {
    Reconfigure,
    Stp,
    PortToggled,
    FlowTable,
    Inconsistency,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no bridge named {0}")]
    NoSuchBridge(String),
    #[error("bridge {0} already exists")]
    BridgeExists(String),
    #[error("no backer named {0}")]
    NoSuchBacker(String),
    #[error("backer {0} already exists")]
    BackerExists(String),
    #[error("no port named {0}")]
    NoSuchPort(String),
    #[error("port {0} already exists")]
    PortExists(String),
    #[error("bundle {0} references unknown port {1}")]
    UnknownSlave(String, String),
    #[error("no bundle named {0}")]
    NoSuchBundle(String),
    #[error("mirror limit ({MAX_MIRRORS}) reached")]
    TooManyMirrors,
    #[error("rule table error: {0}")]
    Table(#[from] TableError),
    #[error("datapath error: {0}")]
    Datapath(#[from] DpError),
}

/// One datapath instance, shared by every bridge of its type.
pub struct Backer {
    pub name: String,
    pub dpif: Box<dyn Dpif>,
    /// Datapath port → owning (bridge, OpenFlow port).
    pub odp_to_ofport: HashMap<OdpPort, (String, OfPort), ahash::RandomState>,
    /// Datapath keys installed as drops for vanished ports.
    pub drop_keys: HashSet<OdpFlowKey, ahash::RandomState>,
    pub need_revalidate: Option<RevalReason>,
    pub revalidate_set: TagSet,
    /// Datapath key → owning (bridge, facet flow).
    pub subfacet_index: HashMap<OdpFlowKey, (String, Flow), ahash::RandomState>,
    pub governor: Option<Governor>,
    pub flow_eviction_threshold: usize,
    pub rates: SubfacetRates,
    pub(crate) last_stats_pull: Option<Instant>,
    pub(crate) last_expire: Option<Instant>,
}

impl Backer {
    fn new(name: &str, dpif: Box<dyn Dpif>) -> Backer {
        Backer {
            name: name.to_string(),
            dpif,
            odp_to_ofport: HashMap::with_hasher(map_hasher()),
            drop_keys: HashSet::with_hasher(map_hasher()),
            need_revalidate: None,
            revalidate_set: TagSet::default(),
            subfacet_index: HashMap::with_hasher(map_hasher()),
            governor: None,
            flow_eviction_threshold: FLOW_EVICTION_THRESHOLD,
            rates: SubfacetRates::new(),
            last_stats_pull: None,
            last_expire: None,
        }
    }

    pub(crate) fn mark_revalidate(&mut self, reason: RevalReason) {
        // Full revalidation subsumes any pending tag set.
        if self.need_revalidate.is_none() {
            self.need_revalidate = Some(reason);
        }
    }
}

/// Parameters for creating a bridge.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into))]
pub struct BridgeParams {
    pub name: String,
    pub backer: String,
    #[builder(default)]
    pub frag_handling: FragHandling,
    #[builder(default)]
    pub stp_enabled: bool,
    #[builder(default, setter(strip_option))]
    pub netflow: Option<NetFlowConfig>,
    #[builder(default, setter(strip_option))]
    pub sflow: Option<SflowConfig>,
    #[builder(default, setter(strip_option))]
    pub ipfix: Option<IpfixConfig>,
}

pub struct Engine {
    pub(crate) backers: HashMap<String, Backer>,
    pub(crate) bridges: HashMap<String, Bridge>,
    /// Install non-exact masks; when false every facet is exact-match.
    pub enable_megaflows: bool,
    /// Defer learn-driven rule mods (testing aid for async flow mods).
    pub clogged: bool,
    /// Disables upcall reception and periodic work during flow restore.
    pub flow_restore_wait: bool,
    pub(crate) deferred_mods: Vec<(String, FlowMod)>,
    pub(crate) xlate_rl: RateLimit,
    pub(crate) stats_rl: RateLimit,
    pub(crate) upcall_rl: RateLimit,
    last_run_fast: Option<Instant>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Engine {
        Engine {
            backers: HashMap::new(),
            bridges: HashMap::new(),
            enable_megaflows: true,
            clogged: false,
            flow_restore_wait: false,
            deferred_mods: Vec::new(),
            xlate_rl: RateLimit::new(60, 10),
            stats_rl: RateLimit::new(60, 10),
            upcall_rl: RateLimit::new(60, 10),
            last_run_fast: None,
        }
    }

    pub fn add_backer(&mut self, name: &str, dpif: Box<dyn Dpif>) -> Result<(), EngineError> {
        if self.backers.contains_key(name) {
            return Err(EngineError::BackerExists(name.to_string()));
        }
        info!("adding backer {name} over datapath {}", dpif.name());
        self.backers.insert(name.to_string(), Backer::new(name, dpif));
        Ok(())
    }

    pub fn add_bridge(&mut self, params: BridgeParams) -> Result<(), EngineError> {
        if self.bridges.contains_key(&params.name) {
            return Err(EngineError::BridgeExists(params.name));
        }
        if !self.backers.contains_key(&params.backer) {
            return Err(EngineError::NoSuchBacker(params.backer));
        }
        info!("adding bridge {} on backer {}", params.name, params.backer);
        let mut bridge = Bridge::new(&params.name, &params.backer, Instant::now());
        bridge.frag_handling = params.frag_handling;
        bridge.stp_enabled = params.stp_enabled;
        bridge.netflow = params.netflow.map(NetFlow::new);
        bridge.sflow = params.sflow.map(SflowAgent::new);
        bridge.ipfix = params.ipfix.map(IpfixAgent::new);
        self.bridges.insert(params.name.clone(), bridge);
        Ok(())
    }

    #[must_use]
    pub fn bridge(&self, name: &str) -> Option<&Bridge> {
        self.bridges.get(name)
    }

    pub fn bridge_mut(&mut self, name: &str) -> Option<&mut Bridge> {
        self.bridges.get_mut(name)
    }

    #[must_use]
    pub fn backer(&self, name: &str) -> Option<&Backer> {
        self.backers.get(name)
    }

    pub fn backer_mut(&mut self, name: &str) -> Option<&mut Backer> {
        self.backers.get_mut(name)
    }

    pub(crate) fn find_port_by_name(&self, name: &str) -> Option<(String, OfPort)> {
        for (bridge_name, bridge) in &self.bridges {
            if let Some(ofp) = bridge.ports_by_name.get(name) {
                return Some((bridge_name.clone(), *ofp));
            }
        }
        None
    }

    /// Add a port to a bridge. Patch ports get no datapath port; everything
    /// else is added to the backing datapath and indexed for upcalls.
    pub fn add_port(
        &mut self,
        bridge_name: &str,
        port_name: &str,
        settings: PortSettings,
    ) -> Result<OfPort, EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        if bridge.ports_by_name.contains_key(port_name) {
            return Err(EngineError::PortExists(port_name.to_string()));
        }
        let backer_name = bridge.backer.clone();
        let is_patch = settings.patch_peer.is_some();
        let ofp = OfPort(bridge.next_ofp);
        bridge.next_ofp += 1;

        let backer = self
            .backers
            .get_mut(&backer_name)
            .ok_or(EngineError::NoSuchBacker(backer_name.clone()))?;
        let odp = if is_patch {
            OdpPort(u32::MAX)
        } else {
            let odp = backer.dpif.port_add(port_name)?;
            backer
                .odp_to_ofport
                .insert(odp, (bridge_name.to_string(), ofp));
            odp
        };
        backer.mark_revalidate(RevalReason::Reconfigure);

        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .unwrap_or_else(|| unreachable!());
        bridge.ports.insert(
            ofp,
            Port {
                ofp,
                odp,
                name: port_name.to_string(),
                flags: settings.flags,
                stp_state: settings.stp_state,
                patch_peer: settings.patch_peer,
                tunnel: settings.tunnel,
                cfm: settings.cfm,
                bundle: None,
            },
        );
        bridge.ports_by_name.insert(port_name.to_string(), ofp);
        debug!("bridge {bridge_name}: added port {port_name} as {ofp} (odp {odp})");
        Ok(ofp)
    }

    /// Remove a port. Upcalls still in flight for its datapath port will
    /// fail the odp→ofp lookup and get drop-keys installed.
    pub fn remove_port(&mut self, bridge_name: &str, port_name: &str) -> Result<(), EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        let Some(ofp) = bridge.ports_by_name.remove(port_name) else {
            return Err(EngineError::NoSuchPort(port_name.to_string()));
        };
        let port = bridge
            .ports
            .remove(&ofp)
            .unwrap_or_else(|| unreachable!());
        for bundle in bridge.bundles.values_mut() {
            bundle.ports.retain(|p| *p != ofp);
        }
        let backer_name = bridge.backer.clone();
        if let Some(backer) = self.backers.get_mut(&backer_name) {
            if !port.is_patch() {
                backer.odp_to_ofport.remove(&port.odp);
                let _ = backer.dpif.port_del(port.odp);
            }
            backer.mark_revalidate(RevalReason::PortToggled);
        }
        Ok(())
    }

    /// Reconfigure a port's STP state.
    pub fn set_stp_state(
        &mut self,
        bridge_name: &str,
        port_name: &str,
        state: StpState,
    ) -> Result<(), EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        let ofp = *bridge
            .ports_by_name
            .get(port_name)
            .ok_or_else(|| EngineError::NoSuchPort(port_name.to_string()))?;
        if let Some(port) = bridge.ports.get_mut(&ofp) {
            if port.stp_state != state {
                debug!("bridge {bridge_name}: port {port_name} STP {:?} -> {state:?}", port.stp_state);
                port.stp_state = state;
                let backer_name = bridge.backer.clone();
                if let Some(backer) = self.backers.get_mut(&backer_name) {
                    backer.mark_revalidate(RevalReason::Stp);
                }
            }
        }
        Ok(())
    }

    /// Create or replace a bundle.
    pub fn configure_bundle(
        &mut self,
        bridge_name: &str,
        config: BundleConfig,
    ) -> Result<(), EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        let mut ports = Vec::with_capacity(config.slaves.len());
        for slave in &config.slaves {
            let ofp = *bridge.ports_by_name.get(slave).ok_or_else(|| {
                EngineError::UnknownSlave(config.name.clone(), slave.clone())
            })?;
            ports.push(ofp);
        }
        // Drop old membership, then point the slaves at the bundle.
        if let Some(old) = bridge.bundles.get(&config.name) {
            let old_ports = old.ports.clone();
            for ofp in old_ports {
                if let Some(p) = bridge.ports.get_mut(&ofp) {
                    p.bundle = None;
                }
            }
        }
        for ofp in &ports {
            if let Some(p) = bridge.ports.get_mut(ofp) {
                p.bundle = Some(config.name.clone());
            }
        }
        let (src_mirrors, dst_mirrors, mirror_out) = bridge
            .bundles
            .get(&config.name)
            .map_or((MirrorMask::default(), MirrorMask::default(), MirrorMask::default()), |b| {
                (b.src_mirrors, b.dst_mirrors, b.mirror_out)
            });
        bridge.bundles.insert(
            config.name.clone(),
            Bundle {
                name: config.name.clone(),
                ports,
                vlan_mode: config.vlan_mode,
                vlan: config.vlan,
                trunks: config.trunks,
                use_priority_tags: config.use_priority_tags,
                bond: config.bond,
                lacp: config.lacp,
                src_mirrors,
                dst_mirrors,
                mirror_out,
            },
        );
        let backer_name = bridge.backer.clone();
        if let Some(backer) = self.backers.get_mut(&backer_name) {
            backer.mark_revalidate(RevalReason::Reconfigure);
        }
        Ok(())
    }

    /// Create or replace a mirror.
    pub fn configure_mirror(
        &mut self,
        bridge_name: &str,
        config: MirrorConfig,
    ) -> Result<(), EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        for referenced in config
            .select_src
            .iter()
            .chain(config.select_dst.iter())
            .chain(config.out_bundle.iter())
        {
            if !bridge.bundles.contains_key(referenced) {
                return Err(EngineError::NoSuchBundle(referenced.clone()));
            }
        }
        let idx = match bridge
            .mirrors
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.name == config.name))
        {
            Some(idx) => idx,
            None => bridge
                .mirrors
                .iter()
                .position(Option::is_none)
                .ok_or(EngineError::TooManyMirrors)?,
        };
        bridge.mirrors[idx] = Some(Mirror {
            name: config.name.clone(),
            idx,
            vlan_filter: config.select_vlans.clone(),
            out_bundle: config.out_bundle.clone(),
            out_vlan: config.out_vlan,
            dup_mirrors: MirrorMask::default(),
            packet_count: 0,
            byte_count: 0,
        });
        update_dup_mirrors(&mut bridge.mirrors);

        let single = MirrorMask(1 << idx);
        for bundle in bridge.bundles.values_mut() {
            bundle.src_mirrors.remove_all(single);
            bundle.dst_mirrors.remove_all(single);
            bundle.mirror_out.remove_all(single);
        }
        for (name, bundle) in bridge.bundles.iter_mut() {
            if config.select_all || config.select_src.contains(name) {
                bundle.src_mirrors.insert(idx);
            }
            if config.select_all || config.select_dst.contains(name) {
                bundle.dst_mirrors.insert(idx);
            }
            if config.out_bundle.as_deref() == Some(name.as_str()) {
                bundle.mirror_out.insert(idx);
            }
        }
        let backer_name = bridge.backer.clone();
        if let Some(backer) = self.backers.get_mut(&backer_name) {
            backer.mark_revalidate(RevalReason::Reconfigure);
        }
        Ok(())
    }

    /// Apply an OpenFlow flow mod.
    pub fn flow_mod(
        &mut self,
        bridge_name: &str,
        fm: FlowMod,
    ) -> Result<Option<RuleId>, EngineError> {
        self.flow_mod_at(bridge_name, fm, Instant::now())
    }

    pub(crate) fn flow_mod_at(
        &mut self,
        bridge_name: &str,
        fm: FlowMod,
        now: Instant,
    ) -> Result<Option<RuleId>, EngineError> {
        let bridge = self
            .bridges
            .get_mut(bridge_name)
            .ok_or_else(|| EngineError::NoSuchBridge(bridge_name.to_string()))?;
        let backer_name = bridge.backer.clone();
        let outcome = bridge.rules.modify(fm, now)?;
        let doomed: Vec<Flow> = outcome
            .removed
            .iter()
            .flat_map(|r| r.facet_flows.iter().copied())
            .collect();
        for facet_flow in doomed {
            facet_remove(self, bridge_name, &facet_flow, now);
        }
        self.mark_revalidate_scope(&backer_name, outcome.revalidate);
        Ok(outcome.added)
    }

    pub(crate) fn mark_revalidate_scope(&mut self, backer_name: &str, scope: RevalScope) {
        let Some(backer) = self.backers.get_mut(backer_name) else {
            return;
        };
        match scope {
            RevalScope::All => backer.mark_revalidate(RevalReason::FlowTable),
            RevalScope::Tags(tags) => backer.revalidate_set.union(tags),
        }
    }

    /// Learn-driven flow mods honor the clog toggle: the datapath side of
    /// the triggering translation proceeds, only the rule-table visibility
    /// is deferred.
    pub(crate) fn apply_learn_mod(&mut self, bridge_name: &str, fm: FlowMod, now: Instant) {
        if self.clogged {
            self.deferred_mods.push((bridge_name.to_string(), fm));
            return;
        }
        if let Err(err) = self.flow_mod_at(bridge_name, fm, now) {
            if self.xlate_rl.admit(now) {
                warn!("learn action flow mod failed: {err}");
            }
        }
    }

    /// Translate a flow as the engine would for a miss, without touching
    /// any state. Backs the `trace` command and the test suites.
    pub fn xlate_flow(&mut self, bridge_name: &str, flow: &Flow, initial_tci: u16) -> XlateOut {
        xlate_actions(
            self,
            XlateIn {
                bridge: bridge_name,
                flow: *flow,
                initial_tci,
                rule: None,
                packet: None,
                may_learn: false,
                resubmit_stats: None,
            },
            Instant::now(),
            None,
        )
    }

    /// Slow-path driver: stats pull-up, revalidation, expiration, table
    /// and learning-table housekeeping.
    pub fn run(&mut self, now: Instant) {
        if self.flow_restore_wait {
            return;
        }
        if !self.clogged && !self.deferred_mods.is_empty() {
            let mods = std::mem::take(&mut self.deferred_mods);
            for (bridge_name, fm) in mods {
                let _ = self.flow_mod_at(&bridge_name, fm, now);
            }
        }

        let backer_names: Vec<String> = self.backers.keys().cloned().collect();
        for backer_name in &backer_names {
            if let Some(backer) = self.backers.get_mut(backer_name) {
                backer.dpif.run();
            }
            let stats_due = {
                let backer = &self.backers[backer_name];
                backer
                    .last_stats_pull
                    .is_none_or(|t| now.duration_since(t) >= STATS_PULL_INTERVAL)
            };
            if stats_due {
                if let Some(b) = self.backers.get_mut(backer_name) {
                    b.last_stats_pull = Some(now);
                }
                crate::facet::update_stats(self, backer_name, now);
            }

            crate::reval::revalidate(self, backer_name, now);

            let expire_due = {
                let backer = &self.backers[backer_name];
                backer
                    .last_expire
                    .is_none_or(|t| now.duration_since(t) >= EXPIRE_INTERVAL)
            };
            if expire_due {
                if let Some(b) = self.backers.get_mut(backer_name) {
                    b.last_expire = Some(now);
                }
                crate::expire::expire(self, backer_name, now);
            }

            crate::reval::random_consistency_check(self, backer_name, now);
        }

        let bridge_names: Vec<String> = self.bridges.keys().cloned().collect();
        for bridge_name in bridge_names {
            let (tags, backer_name) = {
                let Some(bridge) = self.bridges.get_mut(&bridge_name) else {
                    continue;
                };
                if let Some(nf) = bridge.netflow.as_mut() {
                    nf.run(now);
                }
                (bridge.ml.sweep(now), bridge.backer.clone())
            };
            if let Some(backer) = self.backers.get_mut(&backer_name) {
                for tag in tags {
                    backer.revalidate_set.add(tag);
                }
            }
        }
    }

    /// Hot-path driver: handle up to [`MAX_BATCH`] upcalls per backer.
    pub fn run_fast(&mut self, now: Instant) -> usize {
        if self.flow_restore_wait {
            return 0;
        }
        self.last_run_fast = Some(now);
        let backer_names: Vec<String> = self.backers.keys().cloned().collect();
        let mut handled = 0;
        for backer_name in backer_names {
            handled += crate::upcall::dispatch_upcalls(self, &backer_name, now, MAX_BATCH);
        }
        handled
    }

    /// Rate-limited `run_fast` for use inside long slow-path loops, so
    /// revalidation cannot starve miss handling.
    pub(crate) fn run_fast_rl(&mut self, now: Instant) {
        let due = self
            .last_run_fast
            .is_none_or(|t| now.duration_since(t) >= RUN_FAST_INTERVAL);
        if due {
            self.run_fast(now);
        }
    }

    /// Total facets across all bridges (for `dpif/show` and tests).
    #[must_use]
    pub fn n_facets(&self, bridge_name: &str) -> usize {
        self.bridges.get(bridge_name).map_or(0, |b| b.facets.len())
    }
}

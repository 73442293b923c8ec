// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The translation engine.
//!
//! Executes an OpenFlow action list over a mutable "current flow", emitting
//! datapath actions and accumulating a wildcard mask of every flow bit the
//! walk read. The mask is the contract of the resulting megaflow: any two
//! packets agreeing on the masked bits must translate identically, so every
//! decision point here marks what it looked at.

use bitflags::bitflags;
use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, error, warn};

use datapath::{
    OdpAction, OdpPort, SFLOW_COOKIE_MULTIPLE_OUTPUTS, UserspaceCookie, commit_odp_actions,
};
use flow::{
    ETH_TYPE_SLOW, EthAddr, Flow, FlowFrag, MPLS_BOS_MASK, MPLS_TTL_MASK, OfPort, TunnelFlags,
    VLAN_CFI, VLAN_PCP_MASK, VLAN_PCP_SHIFT, VLAN_VID_MASK, Wildcards, tcp_flags,
};
use openflow::{
    FlowMod, FlowModCommand, LearnDst, LearnSpec, LearnSrc, Match, OfAction, RuleId, RuleKind,
    Subfield, TagSet,
};

use crate::bridge::{Bridge, PacketIn};
use openflow::PacketInReason;
use crate::bundle::Bundle;
use crate::engine::Engine;
use crate::mirror::MirrorMask;
use crate::netflow::NfOutput;

/// Ceiling on nested Resubmit/GotoTable frames.
pub const MAX_RESUBMIT_RECURSION: u32 = 64;

bitflags! {
    /// Why a flow must keep being handled in userspace.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
    pub struct SlowPathReason: u16 {
        const CFM = datapath::SLOW_PATH_CFM;
        const LACP = datapath::SLOW_PATH_LACP;
        const STP = datapath::SLOW_PATH_STP;
        const CONTROLLER = datapath::SLOW_PATH_CONTROLLER;
    }
}

impl SlowPathReason {
    /// The protocols whose subfacets get the long expiration cutoff.
    #[must_use]
    pub fn is_protected_protocol(self) -> bool {
        self.intersects(SlowPathReason::CFM | SlowPathReason::LACP | SlowPathReason::STP)
    }
}

/// Traffic counters replayed through a side-effects-only translation so
/// learn and fin-timeout actions observe traffic the datapath forwarded.
#[derive(Clone, Copy, Debug)]
pub struct ResubmitStats {
    pub packets: u64,
    pub bytes: u64,
    pub tcp_flags: u8,
    pub used: Option<Instant>,
}

/// Everything a translation produces.
#[derive(Clone, Debug)]
pub struct XlateOut {
    pub odp_actions: Vec<OdpAction>,
    pub wc: Wildcards,
    pub tags: TagSet,
    pub slow: SlowPathReason,
    pub has_learn: bool,
    pub has_normal: bool,
    pub has_fin_timeout: bool,
    pub nf_output: NfOutput,
    pub mirrors: MirrorMask,
    /// The resubmit-depth ceiling was hit; the action list is empty.
    pub max_resubmit_triggered: bool,
    /// The rule the top-level lookup used. `None` when a special protocol
    /// intercepted the packet before any lookup.
    pub rule: Option<RuleId>,
    /// False when the packet failed an admission check (VLAN or bond):
    /// such drops are per-packet decisions and must not be cached.
    pub may_install: bool,
}

/// Translation input.
pub struct XlateIn<'a> {
    pub bridge: &'a str,
    pub flow: Flow,
    /// VLAN TCI the packet arrived with, before any ingress rewriting.
    pub initial_tci: u16,
    /// Rule to start from; `None` looks up table 0.
    pub rule: Option<RuleId>,
    /// The actual packet, when handling one (enables packet-ins).
    pub packet: Option<Bytes>,
    /// Allow learn actions and MAC learning to mutate state.
    pub may_learn: bool,
    pub resubmit_stats: Option<ResubmitStats>,
}

struct XlateCtx<'e> {
    engine: &'e mut Engine,
    bridge: String,
    flow: Flow,
    base_flow: Flow,
    wc: Wildcards,
    odp: Vec<OdpAction>,
    tags: TagSet,
    slow: SlowPathReason,
    has_learn: bool,
    has_normal: bool,
    has_fin_timeout: bool,
    nf_output: NfOutput,
    mirrors: MirrorMask,
    output_bundles: Vec<String>,
    table_id: u8,
    rule: Option<RuleId>,
    recurse: u32,
    trigger: bool,
    exit: bool,
    stack: Vec<u64>,
    may_install: bool,
    orig_skb_priority: u32,
    sflow_sample_idx: Option<usize>,
    last_output_odp: Option<OdpPort>,
    n_outputs: u32,
    packet: Option<Bytes>,
    may_learn: bool,
    resubmit_stats: Option<ResubmitStats>,
    now: Instant,
    trace: Option<&'e mut String>,
}

/// Classify control-protocol frames that their port subsystem owns. These
/// are counted and pinned to the slow path; the rule table never sees them.
pub(crate) fn process_special(bridge: &Bridge, flow: &Flow) -> SlowPathReason {
    let Some(port) = bridge.ports.get(&flow.in_port) else {
        return SlowPathReason::empty();
    };
    if port.cfm && flow.dl_dst.is_cfm_multicast() {
        return SlowPathReason::CFM;
    }
    if flow.dl_type == ETH_TYPE_SLOW {
        let lacp_bundle = port
            .bundle
            .as_ref()
            .and_then(|b| bridge.bundles.get(b))
            .is_some_and(|b| b.lacp);
        if lacp_bundle {
            return SlowPathReason::LACP;
        }
    }
    if bridge.stp_enabled && flow.dl_dst == EthAddr::STP_MULTICAST {
        return SlowPathReason::STP;
    }
    SlowPathReason::empty()
}

/// Translate. The central entry point for miss handling, revalidation,
/// stats side effects, consistency checks and tracing.
pub fn xlate_actions(
    engine: &mut Engine,
    xin: XlateIn<'_>,
    now: Instant,
    trace: Option<&mut String>,
) -> XlateOut {
    let mut base_flow = xin.flow;
    base_flow.vlan_tci = xin.initial_tci;

    let mut ctx = XlateCtx {
        bridge: xin.bridge.to_string(),
        flow: xin.flow,
        base_flow,
        wc: Wildcards::catchall(),
        odp: Vec::new(),
        tags: TagSet::default(),
        slow: SlowPathReason::empty(),
        has_learn: false,
        has_normal: false,
        has_fin_timeout: false,
        nf_output: NfOutput::None,
        mirrors: MirrorMask::default(),
        output_bundles: Vec::new(),
        table_id: 0,
        rule: xin.rule,
        recurse: 0,
        trigger: false,
        exit: false,
        stack: Vec::new(),
        may_install: true,
        orig_skb_priority: xin.flow.skb_priority,
        sflow_sample_idx: None,
        last_output_odp: None,
        n_outputs: 0,
        packet: xin.packet,
        may_learn: xin.may_learn,
        resubmit_stats: xin.resubmit_stats,
        now,
        trace,
        engine,
    };

    let mut top_rule = xin.rule;
    let special = match ctx.engine.bridges.get(&ctx.bridge) {
        Some(bridge) => process_special(bridge, &ctx.flow),
        None => {
            warn!("xlate on unknown bridge {}", ctx.bridge);
            SlowPathReason::empty()
        }
    };

    if !special.is_empty() {
        ctx.slow = special;
        if let Some(bridge) = ctx.engine.bridges.get_mut(&ctx.bridge) {
            bridge.n_special += 1;
        }
    } else if ctx.engine.bridges.contains_key(&ctx.bridge) {
        ctx.add_sflow_action();
        let rule = match ctx.rule {
            Some(rule) => rule,
            None => ctx.lookup_and_tag(0),
        };
        top_rule = Some(rule);
        ctx.rule = Some(rule);
        ctx.trace_rule(rule);
        ctx.do_rule(rule);

        if ctx.trigger {
            ctx.odp.clear();
            ctx.sflow_sample_idx = None;
            ctx.slow |= SlowPathReason::CONTROLLER;
            let flow = ctx.flow;
            if ctx.engine.xlate_rl.admit(now) {
                error!(
                    "over {MAX_RESUBMIT_RECURSION} resubmit frames on bridge {} (in_port {}); \
                     dropping",
                    ctx.bridge, flow.in_port
                );
            }
            if let Some(t) = ctx.trace.as_deref_mut() {
                t.push_str("    (resubmit depth exceeded)\n");
            }
        } else {
            ctx.fix_sflow_action();
            ctx.add_ipfix_action();
        }
    }

    let mut wc = ctx.wc;
    if !ctx.engine.enable_megaflows {
        wc = Wildcards::exact();
    }
    wc.zero_icmp_upper_tp(&xin.flow);

    XlateOut {
        odp_actions: ctx.odp,
        wc,
        tags: ctx.tags,
        slow: ctx.slow,
        has_learn: ctx.has_learn,
        has_normal: ctx.has_normal,
        has_fin_timeout: ctx.has_fin_timeout,
        nf_output: ctx.nf_output,
        mirrors: ctx.mirrors,
        max_resubmit_triggered: ctx.trigger,
        rule: top_rule,
        may_install: ctx.may_install,
    }
}

impl<'e> XlateCtx<'e> {
    fn bridge_ref(&self) -> &Bridge {
        self.engine
            .bridges
            .get(&self.bridge)
            .unwrap_or_else(|| unreachable!("bridge {} vanished mid-translation", self.bridge))
    }

    fn trace_line(&mut self, line: &str) {
        if let Some(t) = self.trace.as_deref_mut() {
            for _ in 0..self.recurse {
                t.push_str("    ");
            }
            t.push_str(line);
            t.push('\n');
        }
    }

    fn trace_rule(&mut self, rule: RuleId) {
        if self.trace.is_some() {
            let line = {
                let bridge = self.bridge_ref();
                match bridge.rules.rule(rule) {
                    Some(r) => format!(
                        "table {}: rule {:?} kind {:?} priority {} cookie 0x{:x}",
                        self.table_id, r.id, r.kind, r.priority, r.cookie
                    ),
                    None => format!("table {}: dangling rule {rule:?}", self.table_id),
                }
            };
            self.trace_line(&line);
        }
    }

    fn lookup_and_tag(&mut self, table_id: u8) -> RuleId {
        let rule = {
            let bridge = self.engine.bridges.get(&self.bridge).unwrap_or_else(|| {
                unreachable!();
            });
            bridge.rule_lookup(&self.flow, Some(&mut self.wc), table_id)
        };
        let tag = self
            .bridge_ref()
            .rules
            .lookup_tag(table_id, &self.flow, rule);
        if let Some(tag) = tag {
            self.tags.add(tag);
        }
        rule
    }

    fn do_rule(&mut self, rule_id: RuleId) {
        let actions = {
            let bridge = self.bridge_ref();
            match bridge.rules.rule(rule_id) {
                Some(r) => r.actions.clone(),
                None => return,
            }
        };
        let old_rule = self.rule.replace(rule_id);
        self.do_xlate_actions(&actions);
        self.rule = old_rule;
    }

    fn current_rule_cookie(&self) -> u64 {
        self.rule
            .and_then(|id| self.bridge_ref().rules.rule(id))
            .map_or(0, |r| r.cookie)
    }

    #[allow(clippy::too_many_lines)]
    fn do_xlate_actions(&mut self, actions: &[OfAction]) {
        for action in actions {
            if self.exit {
                break;
            }
            match action {
                OfAction::Output { port, max_len } => {
                    self.xlate_output_action(*port, *max_len);
                }
                OfAction::Controller {
                    max_len,
                    controller_id,
                    reason,
                } => {
                    self.execute_controller_action(*max_len, *reason, *controller_id);
                }
                OfAction::Enqueue { port, queue } => {
                    let real_port = if *port == OfPort::IN_PORT {
                        self.flow.in_port
                    } else {
                        *port
                    };
                    let saved = self.flow.skb_priority;
                    self.flow.skb_priority = self.queue_priority(*queue);
                    self.compose_output_action(real_port);
                    self.flow.skb_priority = saved;
                }
                OfAction::SetVlanVid(vid) => {
                    self.wc.masks.vlan_tci = 0xffff;
                    self.flow.vlan_tci =
                        (self.flow.vlan_tci & !VLAN_VID_MASK) | (vid & VLAN_VID_MASK) | VLAN_CFI;
                }
                OfAction::SetVlanPcp(pcp) => {
                    self.wc.masks.vlan_tci = 0xffff;
                    self.flow.vlan_tci = (self.flow.vlan_tci & !VLAN_PCP_MASK)
                        | (u16::from(pcp & 0x07) << VLAN_PCP_SHIFT)
                        | VLAN_CFI;
                }
                OfAction::StripVlan => {
                    self.wc.masks.vlan_tci = 0xffff;
                    self.flow.vlan_tci = 0;
                }
                OfAction::PushVlan(_ethertype) => {
                    self.wc.masks.vlan_tci = 0xffff;
                    self.flow.vlan_tci = VLAN_CFI;
                }
                OfAction::SetEthSrc(addr) => {
                    self.wc.masks.dl_src = EthAddr::BROADCAST;
                    self.flow.dl_src = *addr;
                }
                OfAction::SetEthDst(addr) => {
                    self.wc.masks.dl_dst = EthAddr::BROADCAST;
                    self.flow.dl_dst = *addr;
                }
                OfAction::SetIpv4Src(addr) => {
                    if self.flow.dl_type == flow::ETH_TYPE_IP {
                        self.wc.masks.nw_src = std::net::Ipv4Addr::BROADCAST;
                        self.flow.nw_src = *addr;
                    }
                }
                OfAction::SetIpv4Dst(addr) => {
                    if self.flow.dl_type == flow::ETH_TYPE_IP {
                        self.wc.masks.nw_dst = std::net::Ipv4Addr::BROADCAST;
                        self.flow.nw_dst = *addr;
                    }
                }
                OfAction::SetIpv4Dscp(dscp) => {
                    if self.flow.is_ip_any() {
                        self.wc.masks.nw_tos = 0xff;
                        self.flow.nw_tos = (self.flow.nw_tos & 0x03) | (dscp & 0xfc);
                    }
                }
                OfAction::SetL4SrcPort(port) => {
                    if self.flow_has_l4_ports() {
                        self.wc.masks.tp_src = 0xffff;
                        self.flow.tp_src = *port;
                    }
                }
                OfAction::SetL4DstPort(port) => {
                    if self.flow_has_l4_ports() {
                        self.wc.masks.tp_dst = 0xffff;
                        self.flow.tp_dst = *port;
                    }
                }
                OfAction::SetTunnel(id) => {
                    self.flow.tunnel.tun_id = *id;
                }
                OfAction::SetQueue(queue) => {
                    self.flow.skb_priority = self.queue_priority(*queue);
                }
                OfAction::PopQueue => {
                    self.flow.skb_priority = self.orig_skb_priority;
                }
                OfAction::RegMove { src, dst } => {
                    src.mark(&mut self.wc);
                    dst.mark(&mut self.wc);
                    let value = src.read(&self.flow);
                    dst.write(&mut self.flow, value);
                }
                OfAction::RegLoad { dst, value } => {
                    dst.mark(&mut self.wc);
                    dst.write(&mut self.flow, *value);
                }
                OfAction::StackPush(sf) => {
                    sf.mark(&mut self.wc);
                    self.stack.push(sf.read(&self.flow));
                }
                OfAction::StackPop(sf) => {
                    sf.mark(&mut self.wc);
                    let value = self.stack.pop().unwrap_or(0);
                    sf.write(&mut self.flow, value);
                }
                OfAction::PushMpls(ethertype) => self.push_mpls(*ethertype),
                OfAction::PopMpls(ethertype) => self.pop_mpls(*ethertype),
                OfAction::SetMplsTtl(ttl) => {
                    if self.flow.is_mpls() {
                        self.flow.mpls_lse[0] =
                            (self.flow.mpls_lse[0] & !MPLS_TTL_MASK) | u32::from(*ttl);
                    }
                }
                OfAction::DecMplsTtl => self.dec_mpls_ttl(),
                OfAction::DecTtl { controller_ids } => {
                    if self.dec_ttl(controller_ids) {
                        return;
                    }
                }
                OfAction::Note(_) => {}
                OfAction::Multipath {
                    basis,
                    max_link,
                    dst,
                } => self.multipath(*basis, *max_link, *dst),
                OfAction::Bundle { basis, slaves, dst } => {
                    self.bundle_action(*basis, slaves, *dst);
                }
                OfAction::OutputReg { src, max_len } => {
                    src.mark(&mut self.wc);
                    let port = src.read(&self.flow);
                    self.xlate_output_action(OfPort(port as u16), *max_len);
                }
                OfAction::Learn(spec) => self.xlate_learn(spec),
                OfAction::Exit => self.exit = true,
                OfAction::FinTimeout { idle, hard } => self.fin_timeout(*idle, *hard),
                OfAction::ClearActions => {
                    // Write-actions sets are not modeled; there is nothing
                    // accumulated to clear.
                }
                OfAction::WriteMetadata { value, mask } => {
                    self.wc.masks.metadata |= mask;
                    self.flow.metadata = (self.flow.metadata & !mask) | (value & mask);
                }
                OfAction::GotoTable(table_id) => {
                    if *table_id > self.table_id {
                        let in_port = self.flow.in_port;
                        self.table_id = *table_id;
                        self.xlate_table_action(in_port, *table_id, true);
                    } else if self.engine.xlate_rl.admit(self.now) {
                        warn!(
                            "goto_table to table {} from table {} is not increasing; ignored",
                            table_id, self.table_id
                        );
                    }
                }
                OfAction::Sample {
                    probability,
                    collector_set_id,
                    obs_domain_id,
                    obs_point_id,
                } => self.flow_sample(*probability, *collector_set_id, *obs_domain_id, *obs_point_id),
                OfAction::Resubmit { port, table } => {
                    let in_port = port.unwrap_or(self.flow.in_port);
                    let table_id = table.unwrap_or(self.table_id);
                    self.xlate_table_action(in_port, table_id, false);
                }
            }
        }
    }

    /// Resolve a queue id through the datapath; an unmappable queue keeps
    /// the id as the priority.
    fn queue_priority(&self, queue: u32) -> u32 {
        let backer_name = &self.bridge_ref().backer;
        self.engine
            .backers
            .get(backer_name)
            .and_then(|b| b.dpif.queue_to_priority(queue).ok())
            .unwrap_or(queue)
    }

    fn flow_has_l4_ports(&self) -> bool {
        self.flow.is_ip_any()
            && !self.flow.nw_frag.contains(FlowFrag::LATER)
            && (self.flow.nw_proto == 6 || self.flow.nw_proto == 17)
    }

    fn push_mpls(&mut self, ethertype: u16) {
        commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
        if self.flow.is_mpls() {
            self.flow.mpls_lse[1] = self.flow.mpls_lse[0];
        } else {
            self.flow.mpls_lse[0] = u32::from(self.flow.nw_ttl) | MPLS_BOS_MASK;
        }
        self.flow.dl_type = ethertype;
        self.odp.push(OdpAction::PushMpls {
            ethertype,
            lse: self.flow.mpls_lse[0],
        });
        self.base_flow.dl_type = self.flow.dl_type;
        self.base_flow.mpls_lse = self.flow.mpls_lse;
    }

    fn pop_mpls(&mut self, ethertype: u16) {
        if !self.flow.is_mpls() {
            return;
        }
        commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
        self.flow.mpls_lse[0] = self.flow.mpls_lse[1];
        self.flow.mpls_lse[1] = 0;
        self.flow.dl_type = ethertype;
        self.odp.push(OdpAction::PopMpls { ethertype });
        self.base_flow.dl_type = self.flow.dl_type;
        self.base_flow.mpls_lse = self.flow.mpls_lse;
    }

    fn dec_mpls_ttl(&mut self) {
        if !self.flow.is_mpls() {
            return;
        }
        let ttl = (self.flow.mpls_lse[0] & MPLS_TTL_MASK) as u8;
        if ttl <= 1 {
            self.execute_controller_action(0, PacketInReason::InvalidTtl, 0);
            self.exit = true;
        } else {
            self.flow.mpls_lse[0] =
                (self.flow.mpls_lse[0] & !MPLS_TTL_MASK) | u32::from(ttl - 1);
        }
    }

    /// Returns true when the packet's TTL expired and translation must stop.
    fn dec_ttl(&mut self, controller_ids: &[u16]) -> bool {
        if !self.flow.is_ip_any() {
            return false;
        }
        self.wc.masks.nw_ttl = 0xff;
        if self.flow.nw_ttl > 1 {
            self.flow.nw_ttl -= 1;
            false
        } else {
            for id in controller_ids {
                self.execute_controller_action(0, PacketInReason::InvalidTtl, *id);
            }
            self.exit = true;
            true
        }
    }

    fn multipath(&mut self, basis: u16, max_link: u16, dst: Subfield) {
        self.wc.masks.dl_type = 0xffff;
        self.wc.masks.nw_src = std::net::Ipv4Addr::BROADCAST;
        self.wc.masks.nw_dst = std::net::Ipv4Addr::BROADCAST;
        self.wc.masks.nw_proto = 0xff;
        self.wc.masks.tp_src = 0xffff;
        self.wc.masks.tp_dst = 0xffff;
        dst.mark(&mut self.wc);
        let words = [
            u32::from(self.flow.nw_src),
            u32::from(self.flow.nw_dst),
            u32::from(self.flow.tp_src) << 16 | u32::from(self.flow.tp_dst),
            u32::from(self.flow.nw_proto),
        ];
        let hash = flow::hash_words(&words, u32::from(basis));
        let link = u64::from(hash) % (u64::from(max_link) + 1);
        dst.write(&mut self.flow, link);
    }

    fn bundle_action(&mut self, basis: u16, slaves: &[OfPort], dst: Option<Subfield>) {
        self.wc.masks.dl_src = EthAddr::BROADCAST;
        self.wc.masks.dl_dst = EthAddr::BROADCAST;
        let enabled: Vec<OfPort> = {
            let bridge = self.bridge_ref();
            slaves
                .iter()
                .copied()
                .filter(|ofp| {
                    bridge
                        .ports
                        .get(ofp)
                        .is_some_and(|p| p.stp_state.forwards())
                })
                .collect()
        };
        let selected = if enabled.is_empty() {
            OfPort::NONE
        } else {
            let src = self.flow.dl_src.0;
            let dstm = self.flow.dl_dst.0;
            let words = [
                u32::from_be_bytes([src[0], src[1], src[2], src[3]]),
                u32::from_be_bytes([src[4], src[5], dstm[0], dstm[1]]),
                u32::from_be_bytes([dstm[2], dstm[3], dstm[4], dstm[5]]),
            ];
            let hash = flow::hash_words(&words, u32::from(basis));
            enabled[hash as usize % enabled.len()]
        };
        match dst {
            Some(dst) => {
                dst.mark(&mut self.wc);
                dst.write(&mut self.flow, u64::from(selected.0));
            }
            None => {
                if selected != OfPort::NONE {
                    self.xlate_output_action(selected, 0);
                }
            }
        }
    }

    fn fin_timeout(&mut self, idle: u16, hard: u16) {
        if self.flow.nw_proto != 6 {
            return;
        }
        self.has_fin_timeout = true;
        let Some(stats) = self.resubmit_stats else {
            return;
        };
        if stats.tcp_flags & (tcp_flags::FIN | tcp_flags::RST) == 0 {
            return;
        }
        let Some(rule_id) = self.rule else { return };
        let bridge = self
            .engine
            .bridges
            .get_mut(&self.bridge)
            .unwrap_or_else(|| unreachable!());
        if let Some(rule) = bridge.rules.rule_mut(rule_id) {
            if rule.kind == RuleKind::Normal {
                rule.reduce_timeouts(idle, hard);
            }
        }
    }

    fn xlate_learn(&mut self, spec: &LearnSpec) {
        self.has_learn = true;
        for field in &spec.specs {
            if let LearnSrc::Field(sf) = field.src {
                sf.mark(&mut self.wc);
            }
        }
        if !self.may_learn {
            return;
        }
        let mut m = Match::catchall();
        let mut actions = Vec::new();
        for field in &spec.specs {
            let value = match field.src {
                LearnSrc::Field(sf) => sf.read(&self.flow),
                LearnSrc::Immediate(v) => v,
            };
            match field.dst {
                LearnDst::Match(dst) => {
                    dst.write(&mut m.flow, value);
                    dst.mark(&mut m.wc);
                }
                LearnDst::Load(dst) => actions.push(OfAction::RegLoad { dst, value }),
                LearnDst::Output => actions.push(OfAction::Output {
                    port: OfPort(value as u16),
                    max_len: 0,
                }),
            }
        }
        let fm = FlowMod {
            command: FlowModCommand::Add,
            table_id: spec.table_id,
            m,
            priority: spec.priority,
            cookie: spec.cookie,
            idle_timeout: spec.idle_timeout,
            hard_timeout: spec.hard_timeout,
            actions,
        };
        let bridge = self.bridge.clone();
        self.engine.apply_learn_mod(&bridge, fm, self.now);
    }

    fn flow_sample(
        &mut self,
        probability: u16,
        collector_set_id: u32,
        obs_domain_id: u32,
        obs_point_id: u32,
    ) {
        commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
        self.odp.push(OdpAction::Sample {
            probability: u32::from(probability) << 16 | u32::from(probability),
            actions: vec![OdpAction::Userspace {
                pid: 0,
                cookie: UserspaceCookie::FlowSample {
                    probability,
                    collector_set_id,
                    obs_domain_id,
                    obs_point_id,
                },
            }],
        });
    }

    fn add_sflow_action(&mut self) {
        let probability = {
            let bridge = self.bridge_ref();
            match &bridge.sflow {
                Some(agent) => agent.probability(),
                None => return,
            }
        };
        self.odp.push(OdpAction::Sample {
            probability,
            actions: vec![OdpAction::Userspace {
                pid: 0,
                cookie: UserspaceCookie::Sflow {
                    vlan_tci: self.flow.vlan_tci,
                    output: 0,
                },
            }],
        });
        self.sflow_sample_idx = Some(self.odp.len() - 1);
    }

    /// The sFlow cookie's output field is only known once the whole action
    /// list exists; patch it in after the fact.
    fn fix_sflow_action(&mut self) {
        let Some(at) = self.sflow_sample_idx else {
            return;
        };
        let output = match self.n_outputs {
            0 => 0,
            1 => self.last_output_odp.map_or(0, |p| p.0),
            n => SFLOW_COOKIE_MULTIPLE_OUTPUTS | n,
        };
        if let Some(OdpAction::Sample { actions, .. }) = self.odp.get_mut(at) {
            if let Some(OdpAction::Userspace {
                cookie: UserspaceCookie::Sflow { output: slot, .. },
                ..
            }) = actions.first_mut()
            {
                *slot = output;
            }
        }
    }

    fn add_ipfix_action(&mut self) {
        let probability = {
            let bridge = self.bridge_ref();
            match &bridge.ipfix {
                Some(agent) if agent.bridge_exporter_enabled() => agent.bridge_probability(),
                _ => return,
            }
        };
        commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
        self.odp.push(OdpAction::Sample {
            probability,
            actions: vec![OdpAction::Userspace {
                pid: 0,
                cookie: UserspaceCookie::IpfixBridge,
            }],
        });
    }

    fn execute_controller_action(
        &mut self,
        max_len: u16,
        reason: PacketInReason,
        controller_id: u16,
    ) {
        self.slow |= SlowPathReason::CONTROLLER;
        let Some(packet) = self.packet.clone() else {
            return;
        };
        let cookie = self.current_rule_cookie();
        let pin = PacketIn {
            packet,
            reason,
            table_id: self.table_id,
            cookie,
            flow: self.flow,
            controller_id,
            send_len: max_len,
        };
        if let Some(bridge) = self.engine.bridges.get_mut(&self.bridge) {
            bridge.packet_ins.push_back(pin);
        }
    }

    fn xlate_table_action(&mut self, in_port: OfPort, table_id: u8, _may_packet_in: bool) {
        if self.recurse >= MAX_RESUBMIT_RECURSION {
            self.trigger = true;
            return;
        }
        self.recurse += 1;
        let old_in_port = self.flow.in_port;
        let old_table = self.table_id;
        self.flow.in_port = in_port;
        self.table_id = table_id;
        let rule = self.lookup_and_tag(table_id);
        self.trace_rule(rule);
        if let Some(stats) = self.resubmit_stats {
            // Rules reached through resubmits see the datapath-forwarded
            // traffic too; the facet's own rule is credited by the stats
            // push itself.
            let bridge = self
                .engine
                .bridges
                .get_mut(&self.bridge)
                .unwrap_or_else(|| unreachable!());
            if let Some(r) = bridge.rules.rule_mut(rule) {
                if r.kind == RuleKind::Normal {
                    r.credit(stats.packets, stats.bytes, stats.used);
                }
            }
        }
        self.do_rule(rule);
        self.flow.in_port = old_in_port;
        self.table_id = old_table;
        self.recurse -= 1;
    }

    fn xlate_output_action(&mut self, port: OfPort, max_len: u16) {
        match port {
            OfPort::IN_PORT => {
                let in_port = self.flow.in_port;
                self.compose_output_action(in_port);
            }
            OfPort::TABLE => {
                let in_port = self.flow.in_port;
                self.xlate_table_action(in_port, 0, true);
            }
            OfPort::NORMAL => self.xlate_normal(),
            OfPort::FLOOD => self.flood_packets(false),
            OfPort::ALL => self.flood_packets(true),
            OfPort::CONTROLLER => {
                self.execute_controller_action(max_len, PacketInReason::Action, 0);
            }
            OfPort::NONE => {}
            OfPort::LOCAL => self.compose_output_action(OfPort::LOCAL),
            port => {
                if port == self.flow.in_port {
                    // Output back out the ingress needs the explicit
                    // IN_PORT form; silently dropping is the classic
                    // switch behavior.
                } else {
                    self.compose_output_action(port);
                }
            }
        }
    }

    fn flood_packets(&mut self, all: bool) {
        let mut ports: Vec<OfPort> = {
            let bridge = self.bridge_ref();
            bridge
                .ports
                .values()
                .filter(|p| p.ofp != self.flow.in_port)
                .filter(|p| all || p.may_flood())
                .map(|p| p.ofp)
                .collect()
        };
        ports.sort_unstable();
        for ofp in ports {
            self.compose_output_action(ofp);
        }
        self.nf_output = NfOutput::Flood;
    }

    fn compose_output_action(&mut self, ofp: OfPort) {
        let Some(port) = self.bridge_ref().ports.get(&ofp).cloned() else {
            debug!("bridge {}: output to unknown port {ofp}", self.bridge);
            return;
        };
        if port.flags.contains(crate::port::PortFlags::NO_FWD) {
            return;
        }
        if let Some(peer) = &port.patch_peer {
            self.patch_port_output(peer.clone());
            return;
        }
        if !port.stp_state.forwards() {
            return;
        }

        if let Some(tun) = port.tunnel {
            let saved = self.flow.tunnel;
            self.flow.tunnel.ip_dst = tun.remote_ip;
            if let Some(local) = tun.local_ip {
                self.flow.tunnel.ip_src = local;
            }
            if let Some(key) = tun.out_key {
                self.flow.tunnel.tun_id = key;
                self.flow.tunnel.flags |= TunnelFlags::KEY;
            }
            self.flow.tunnel.ip_tos = tun.tos;
            self.flow.tunnel.ip_ttl = if tun.ttl == 0 { 64 } else { tun.ttl };
            if tun.dont_fragment {
                self.flow.tunnel.flags |= TunnelFlags::DONT_FRAGMENT;
            }
            if tun.csum {
                self.flow.tunnel.flags |= TunnelFlags::CSUM;
            }
            commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
            self.odp.push(OdpAction::Output(port.odp));
            self.flow.tunnel = saved;
        } else {
            commit_odp_actions(&mut self.base_flow, &self.flow, &mut self.odp);
            self.odp.push(OdpAction::Output(port.odp));
        }

        self.n_outputs += 1;
        self.last_output_odp = Some(port.odp);
        self.nf_output = match self.nf_output {
            NfOutput::None => NfOutput::Iface(ofp.0),
            NfOutput::Flood => NfOutput::Flood,
            _ => NfOutput::Multi,
        };
    }

    fn patch_port_output(&mut self, peer_name: String) {
        let Some((peer_bridge, peer_ofp)) = self.engine.find_port_by_name(&peer_name) else {
            debug!("patch peer {peer_name} not found");
            return;
        };
        if self.recurse >= MAX_RESUBMIT_RECURSION {
            self.trigger = true;
            return;
        }
        let saved_bridge = std::mem::replace(&mut self.bridge, peer_bridge);
        let saved_flow = self.flow;
        let saved_table = self.table_id;
        let saved_rule = self.rule;

        // The peer bridge starts from a clean pipeline context.
        self.flow.in_port = peer_ofp;
        self.flow.metadata = 0;
        self.flow.regs = [0; flow::FLOW_N_REGS];
        self.table_id = 0;
        self.rule = None;

        let special = process_special(self.bridge_ref(), &self.flow);
        if special.is_empty() {
            self.xlate_table_action(peer_ofp, 0, true);
        } else {
            self.slow |= special;
        }

        self.bridge = saved_bridge;
        self.flow = saved_flow;
        self.table_id = saved_table;
        self.rule = saved_rule;
    }

    // OFPP_NORMAL: the L2 learning switch.
    fn xlate_normal(&mut self) {
        self.has_normal = true;
        self.wc.masks.dl_src = EthAddr::BROADCAST;
        self.wc.masks.dl_dst = EthAddr::BROADCAST;
        self.wc.masks.vlan_tci = 0xffff;

        let in_port = self.flow.in_port;
        let Some(in_bundle) = self
            .bridge_ref()
            .bundle_for_port(in_port)
            .cloned()
        else {
            debug!(
                "bridge {}: NORMAL on port {in_port} outside any bundle; dropping",
                self.bridge
            );
            return;
        };

        let Some(vid) = in_bundle.input_vid(self.flow.vlan_tci) else {
            self.may_install = false;
            if self.engine.xlate_rl.admit(self.now) {
                debug!(
                    "bridge {}: dropping vlan {} packet received on bundle {} in port {in_port}",
                    self.bridge,
                    self.flow.vlan_vid(),
                    in_bundle.name
                );
            }
            return;
        };
        let vlan = in_bundle.input_vid_to_vlan(vid);

        if let Some(bond) = in_bundle.bond {
            if bond.mode == crate::bundle::BondMode::Slb
                && self.flow.dl_dst.is_multicast()
                && Some(in_port) != in_bundle.bond_active_slave()
            {
                // SLB loopback suppression: only the active slave may
                // deliver multicast into the bridge.
                self.may_install = false;
                return;
            }
        }

        if self.may_learn {
            self.update_learning(&in_bundle, vlan);
        }

        let (dst_bundle, lookup_tag) = {
            let bridge = self.bridge_ref();
            let tag = bridge.ml.tag_for(self.flow.dl_dst, vlan);
            let hit = bridge
                .ml
                .lookup(self.flow.dl_dst, vlan, self.now)
                .map(|e| e.bundle.clone());
            (hit, tag)
        };
        self.tags.add(lookup_tag);

        match dst_bundle {
            Some(name) if name == in_bundle.name => {
                // Learned on the ingress bundle: nothing to do.
            }
            Some(name) => {
                self.output_normal(&name, vlan);
            }
            None => {
                let names: Vec<String> = {
                    let bridge = self.bridge_ref();
                    let mut names: Vec<String> = bridge
                        .bundles
                        .values()
                        .filter(|b| b.name != in_bundle.name)
                        .filter(|b| b.includes_vlan(vlan))
                        .filter(|b| b.mirror_out.is_empty())
                        .filter(|b| {
                            b.ports.iter().any(|ofp| {
                                bridge.ports.get(ofp).is_some_and(crate::port::Port::may_flood)
                            })
                        })
                        .map(|b| b.name.clone())
                        .collect();
                    names.sort_unstable();
                    names
                };
                for name in names {
                    self.output_normal(&name, vlan);
                }
                self.nf_output = NfOutput::Flood;
            }
        }

        self.add_mirror_actions(&in_bundle.name, vlan);
    }

    fn update_learning(&mut self, in_bundle: &Bundle, vlan: u16) {
        let learns = self
            .bridge_ref()
            .ports
            .get(&self.flow.in_port)
            .is_some_and(|p| p.stp_state.learns());
        if !learns || self.flow.dl_src.is_multicast() {
            return;
        }
        let grat = self.flow.is_gratuitous_arp();
        let dl_src = self.flow.dl_src;
        let now = self.now;

        let moved_tag = {
            let bridge = self
                .engine
                .bridges
                .get_mut(&self.bridge)
                .unwrap_or_else(|| unreachable!());
            if grat {
                if let Some(entry) = bridge.ml.entry_mut(dl_src, vlan) {
                    if entry.is_grat_arp_locked(now) && entry.bundle != in_bundle.name {
                        // A reflected copy of our own gratuitous ARP; do
                        // not let it re-learn the address elsewhere.
                        return;
                    }
                }
            }
            let tag = bridge.ml.learn(dl_src, vlan, &in_bundle.name, now);
            if grat && in_bundle.bond.is_none() {
                if let Some(entry) = bridge.ml.entry_mut(dl_src, vlan) {
                    entry.set_grat_arp_lock(now);
                }
            }
            tag
        };
        if let Some(tag) = moved_tag {
            let backer = self.bridge_ref().backer.clone();
            if let Some(backer) = self.engine.backers.get_mut(&backer) {
                backer.revalidate_set.add(tag);
            }
        }
    }

    fn output_normal(&mut self, bundle_name: &str, vlan: u16) {
        let Some(bundle) = self.bridge_ref().bundles.get(bundle_name).cloned() else {
            return;
        };
        let Some(vid) = bundle.output_vlan_to_vid(vlan) else {
            return;
        };
        let port = if bundle.is_bonded() {
            self.wc.masks.dl_src = EthAddr::BROADCAST;
            if bundle.bond.map(|b| b.mode) == Some(crate::bundle::BondMode::BalanceTcp) {
                self.wc.masks.nw_src = std::net::Ipv4Addr::BROADCAST;
                self.wc.masks.nw_dst = std::net::Ipv4Addr::BROADCAST;
                self.wc.masks.tp_src = 0xffff;
                self.wc.masks.tp_dst = 0xffff;
                self.wc.masks.dl_type = 0xffff;
            }
            bundle.bond_choose_output(self.flow.dl_src, &self.flow, vlan)
        } else {
            bundle.ports.first().copied()
        };
        let Some(ofp) = port else {
            return;
        };
        let tci = bundle.output_tci(vid, self.flow.vlan_tci);
        let saved_tci = self.flow.vlan_tci;
        self.flow.vlan_tci = tci;
        self.compose_output_action(ofp);
        self.flow.vlan_tci = saved_tci;
        self.output_bundles.push(bundle.name);
    }

    fn add_mirror_actions(&mut self, in_bundle: &str, vlan: u16) {
        let (mut pending, snapshot) = {
            let bridge = self.bridge_ref();
            let mut mask = bridge
                .bundles
                .get(in_bundle)
                .map_or(MirrorMask::default(), |b| b.src_mirrors);
            for out in &self.output_bundles {
                if let Some(b) = bridge.bundles.get(out) {
                    mask = mask.union(b.dst_mirrors);
                }
            }
            (mask, bridge.mirrors.clone())
        };
        if pending.is_empty() {
            return;
        }
        while let Some(idx) = pending.first() {
            let single = MirrorMask(1 << idx);
            let Some(mirror) = snapshot[idx].as_ref() else {
                pending.remove_all(single);
                continue;
            };
            if let Some(filter) = &mirror.vlan_filter {
                if !filter.contains(vlan) {
                    pending.remove_all(single);
                    continue;
                }
            }
            pending.remove_all(single);
            pending.remove_all(mirror.dup_mirrors);
            self.mirrors = self.mirrors.union(mirror.dup_mirrors.union(single));

            if let Some(out) = mirror.out_bundle.clone() {
                self.output_normal(&out, vlan);
            } else if let Some(out_vlan) = mirror.out_vlan {
                let names: Vec<String> = {
                    let bridge = self.bridge_ref();
                    let mut names: Vec<String> = bridge
                        .bundles
                        .values()
                        .filter(|b| b.includes_vlan(out_vlan))
                        .filter(|b| b.mirror_out.is_empty())
                        .map(|b| b.name.clone())
                        .collect();
                    names.sort_unstable();
                    names
                };
                for name in names {
                    self.output_normal(&name, out_vlan);
                }
            }
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Line-oriented control commands.
//!
//! `command [args...]` in, text out. This is the operator surface the
//! daemon's REPL (and any management socket an integrator wires up) talks
//! to; everything here formats live engine state, it holds none of its own.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::time::Instant;

use flow::{EthAddr, Flow, OfPort, VLAN_CFI, Wildcards, vid_pcp_to_tci};

use crate::engine::{Engine, RevalReason};
use crate::facet::facet_remove;
use crate::xlate::{XlateIn, xlate_actions};

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),
    #[error("missing argument: {0}")]
    MissingArg(&'static str),
    #[error("bad argument: {0}")]
    BadArg(String),
    #[error("no bridge named {0}")]
    NoSuchBridge(String),
}

impl Engine {
    /// Dispatch one control command line.
    pub fn handle_ctl(&mut self, line: &str) -> Result<String, CtlError> {
        let mut parts = line.split_whitespace();
        let command = parts.next().ok_or(CtlError::MissingArg("command"))?;
        let args: Vec<&str> = parts.collect();
        match command {
            "trace" => self.ctl_trace(&args),
            "fdb/flush" => self.ctl_fdb_flush(&args),
            "fdb/show" => self.ctl_fdb_show(&args),
            "ofproto/self-check" => self.ctl_self_check(&args),
            "dpif/show" => self.ctl_dpif_show(),
            "dpif/dump-flows" => self.ctl_dump_flows(&args, false),
            "dpif/dump-megaflows" => self.ctl_dump_flows(&args, true),
            "dpif/del-flows" => self.ctl_del_flows(&args),
            "dpif/enable-megaflows" => {
                self.enable_megaflows = true;
                self.mark_all_backers(RevalReason::Reconfigure);
                Ok("megaflows enabled".to_string())
            }
            "dpif/disable-megaflows" => {
                self.enable_megaflows = false;
                self.mark_all_backers(RevalReason::Reconfigure);
                Ok("megaflows disabled".to_string())
            }
            other => Err(CtlError::UnknownCommand(other.to_string())),
        }
    }

    fn mark_all_backers(&mut self, reason: RevalReason) {
        for backer in self.backers.values_mut() {
            backer.mark_revalidate(reason);
        }
    }

    fn require_bridge(&self, args: &[&str]) -> Result<String, CtlError> {
        let name = args.first().ok_or(CtlError::MissingArg("bridge"))?;
        if self.bridges.contains_key(*name) {
            Ok((*name).to_string())
        } else {
            Err(CtlError::NoSuchBridge((*name).to_string()))
        }
    }

    fn ctl_trace(&mut self, args: &[&str]) -> Result<String, CtlError> {
        let bridge_name = self.require_bridge(args)?;
        let spec = args.get(1).ok_or(CtlError::MissingArg("flow"))?;
        let flow = parse_flow_spec(spec)?;
        let mut trace = String::new();
        let xout = xlate_actions(
            self,
            XlateIn {
                bridge: &bridge_name,
                flow,
                initial_tci: flow.vlan_tci,
                rule: None,
                packet: None,
                may_learn: false,
                resubmit_stats: None,
            },
            Instant::now(),
            Some(&mut trace),
        );
        let mut out = String::new();
        let _ = writeln!(out, "Bridge: {bridge_name}");
        let _ = writeln!(out, "Flow: {}", format_flow(&flow));
        out.push_str(&trace);
        let _ = writeln!(out, "Datapath actions: {:?}", xout.odp_actions);
        if !xout.slow.is_empty() {
            let _ = writeln!(out, "This flow is handled in the slow path: {:?}", xout.slow);
        }
        if xout.max_resubmit_triggered {
            let _ = writeln!(out, "Translation aborted: resubmit depth exceeded");
        }
        Ok(out)
    }

    fn ctl_fdb_flush(&mut self, args: &[&str]) -> Result<String, CtlError> {
        let targets: Vec<String> = if args.is_empty() {
            self.bridges.keys().cloned().collect()
        } else {
            vec![self.require_bridge(args)?]
        };
        for name in &targets {
            let backer_name = {
                let Some(bridge) = self.bridges.get_mut(name) else {
                    continue;
                };
                bridge.ml.flush();
                bridge.backer.clone()
            };
            if let Some(backer) = self.backers.get_mut(&backer_name) {
                backer.mark_revalidate(RevalReason::Reconfigure);
            }
        }
        Ok("table successfully flushed".to_string())
    }

    fn ctl_fdb_show(&mut self, args: &[&str]) -> Result<String, CtlError> {
        let bridge_name = self.require_bridge(args)?;
        let bridge = &self.bridges[&bridge_name];
        let now = Instant::now();
        let mut out = String::from(" bundle  VLAN  MAC                Age\n");
        let mut entries: Vec<_> = bridge.ml.entries().collect();
        entries.sort_by(|a, b| (a.vlan, a.mac).cmp(&(b.vlan, b.mac)));
        for entry in entries {
            let age = crate::mac::MAC_ENTRY_IDLE
                .saturating_sub(entry.expires.saturating_duration_since(now))
                .as_secs();
            let _ = writeln!(
                out,
                "{:>7}  {:>4}  {}  {:>3}",
                entry.bundle, entry.vlan, entry.mac, age
            );
        }
        Ok(out)
    }

    fn ctl_self_check(&mut self, args: &[&str]) -> Result<String, CtlError> {
        let targets: Vec<String> = if args.is_empty() {
            self.bridges.keys().cloned().collect()
        } else {
            vec![self.require_bridge(args)?]
        };
        let now = Instant::now();
        let mut checked = 0usize;
        let mut bad = 0usize;
        for bridge_name in targets {
            let flows: Vec<Flow> = self.bridges[&bridge_name].facets.keys().copied().collect();
            for flow in flows {
                checked += 1;
                if !crate::facet::facet_check_consistency(self, &bridge_name, &flow, now) {
                    bad += 1;
                    let backer = self.bridges[&bridge_name].backer.clone();
                    if let Some(backer) = self.backers.get_mut(&backer) {
                        backer.mark_revalidate(RevalReason::Inconsistency);
                    }
                }
            }
        }
        if bad == 0 {
            Ok(format!("checked {checked} facets, all consistent"))
        } else {
            Ok(format!("checked {checked} facets, {bad} inconsistent (revalidation scheduled)"))
        }
    }

    fn ctl_dpif_show(&mut self) -> Result<String, CtlError> {
        let mut out = String::new();
        let mut backer_names: Vec<&String> = self.backers.keys().collect();
        backer_names.sort();
        for backer_name in backer_names {
            let backer = &self.backers[backer_name];
            let _ = writeln!(
                out,
                "{backer_name}: subfacets {} (max {}), avg lifespan {} ms, \
                 hourly add/del {:.3}/{:.3}, daily add/del {:.3}/{:.3}, stats pulls {}",
                backer.subfacet_index.len(),
                backer.rates.max_n_subfacets,
                backer.rates.avg_lifespan_ms(),
                backer.rates.hourly.add.get(),
                backer.rates.hourly.del.get(),
                backer.rates.daily.add.get(),
                backer.rates.daily.del.get(),
                backer.rates.n_update_stats,
            );
            let mut bridge_names: Vec<&String> = self
                .bridges
                .iter()
                .filter(|(_, b)| b.backer == *backer_name)
                .map(|(name, _)| name)
                .collect();
            bridge_names.sort();
            for bridge_name in bridge_names {
                let bridge = &self.bridges[bridge_name];
                let _ = writeln!(
                    out,
                    "  {bridge_name}: hit:{} missed:{} special:{} facets:{} rules:{}",
                    bridge.n_hit,
                    bridge.n_missed,
                    bridge.n_special,
                    bridge.facets.len(),
                    bridge.rules.n_rules(),
                );
                let mut ports: Vec<_> = bridge.ports.values().collect();
                ports.sort_by_key(|p| p.ofp);
                for port in ports {
                    let _ = writeln!(out, "    {} {}/{}", port.name, port.ofp, port.odp);
                }
            }
        }
        Ok(out)
    }

    fn ctl_dump_flows(&mut self, args: &[&str], megaflows: bool) -> Result<String, CtlError> {
        let bridge_name = self.require_bridge(args)?;
        let bridge = &self.bridges[&bridge_name];
        let now = Instant::now();
        let mut out = String::new();
        let mut facets: Vec<_> = bridge.facets.values().collect();
        facets.sort_by_key(|f| f.created);
        for facet in facets {
            let used = facet
                .used
                .map_or("never".to_string(), |u| {
                    format!("{:.3}s", now.saturating_duration_since(u).as_secs_f64())
                });
            let _ = write!(
                out,
                "{}, packets:{}, bytes:{}, used:{used}",
                format_flow(&facet.flow),
                facet.packet_count,
                facet.byte_count
            );
            if megaflows {
                let _ = write!(out, ", mask:{}", format_mask(&facet.xout.wc));
            }
            let _ = writeln!(out, ", actions:{:?}", facet.xout.odp_actions);
            for subfacet in &facet.subfacets {
                let _ = writeln!(
                    out,
                    "  subfacet {:?}: packets:{}, bytes:{}",
                    subfacet.path, subfacet.dp_packet_count, subfacet.dp_byte_count
                );
            }
        }
        Ok(out)
    }

    fn ctl_del_flows(&mut self, args: &[&str]) -> Result<String, CtlError> {
        let bridge_name = self.require_bridge(args)?;
        let now = Instant::now();
        let flows: Vec<Flow> = self.bridges[&bridge_name].facets.keys().copied().collect();
        let n = flows.len();
        for flow in flows {
            facet_remove(self, &bridge_name, &flow, now);
        }
        Ok(format!("deleted {n} facets"))
    }
}

fn parse_mac(s: &str) -> Result<EthAddr, CtlError> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(CtlError::BadArg(format!("bad MAC {s}")));
    }
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| CtlError::BadArg(format!("bad MAC {s}")))?;
    }
    Ok(EthAddr(out))
}

fn parse_num(s: &str) -> Result<u64, CtlError> {
    let result = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    result.map_err(|_| CtlError::BadArg(format!("bad number {s}")))
}

/// Parse `key=value[,key=value...]` into a flow.
fn parse_flow_spec(spec: &str) -> Result<Flow, CtlError> {
    let mut flow = Flow::default();
    let mut vid: Option<u16> = None;
    let mut pcp: u8 = 0;
    for item in spec.split(',') {
        let Some((key, value)) = item.split_once('=') else {
            return Err(CtlError::BadArg(format!("bad flow item {item}")));
        };
        match key {
            "in_port" => flow.in_port = OfPort(parse_num(value)? as u16),
            "dl_src" => flow.dl_src = parse_mac(value)?,
            "dl_dst" => flow.dl_dst = parse_mac(value)?,
            "dl_type" => flow.dl_type = parse_num(value)? as u16,
            "vlan_vid" => vid = Some(parse_num(value)? as u16),
            "vlan_pcp" => pcp = parse_num(value)? as u8,
            "nw_src" => {
                flow.nw_src = value
                    .parse::<Ipv4Addr>()
                    .map_err(|_| CtlError::BadArg(format!("bad address {value}")))?;
            }
            "nw_dst" => {
                flow.nw_dst = value
                    .parse::<Ipv4Addr>()
                    .map_err(|_| CtlError::BadArg(format!("bad address {value}")))?;
            }
            "nw_proto" => flow.nw_proto = parse_num(value)? as u8,
            "nw_ttl" => flow.nw_ttl = parse_num(value)? as u8,
            "tp_src" => flow.tp_src = parse_num(value)? as u16,
            "tp_dst" => flow.tp_dst = parse_num(value)? as u16,
            other => return Err(CtlError::BadArg(format!("unknown field {other}"))),
        }
    }
    if let Some(vid) = vid {
        flow.vlan_tci = vid_pcp_to_tci(vid, pcp);
    }
    Ok(flow)
}

fn format_flow(flow: &Flow) -> String {
    let mut out = format!(
        "in_port={},dl_src={},dl_dst={}",
        flow.in_port, flow.dl_src, flow.dl_dst
    );
    if flow.vlan_tci & VLAN_CFI != 0 {
        let _ = write!(out, ",vlan_vid={}", flow.vlan_vid());
    }
    if flow.dl_type != 0 {
        let _ = write!(out, ",dl_type=0x{:04x}", flow.dl_type);
    }
    if flow.is_ip_any() {
        let _ = write!(
            out,
            ",nw_src={},nw_dst={},nw_proto={}",
            flow.nw_src, flow.nw_dst, flow.nw_proto
        );
        if flow.nw_proto == 6 || flow.nw_proto == 17 {
            let _ = write!(out, ",tp_src={},tp_dst={}", flow.tp_src, flow.tp_dst);
        }
    }
    out
}

/// Human summary of which fields a mask pins down.
fn format_mask(wc: &Wildcards) -> String {
    if wc.is_exact() {
        return "exact".to_string();
    }
    let m = &wc.masks;
    let mut fields = Vec::new();
    if m.in_port != OfPort(0) {
        fields.push("in_port");
    }
    if !m.dl_src.is_zero() {
        fields.push("dl_src");
    }
    if !m.dl_dst.is_zero() {
        fields.push("dl_dst");
    }
    if m.dl_type != 0 {
        fields.push("dl_type");
    }
    if m.vlan_tci != 0 {
        fields.push("vlan_tci");
    }
    if !m.nw_src.is_unspecified() {
        fields.push("nw_src");
    }
    if !m.nw_dst.is_unspecified() {
        fields.push("nw_dst");
    }
    if m.nw_proto != 0 {
        fields.push("nw_proto");
    }
    if m.nw_frag.bits() != 0 {
        fields.push("nw_frag");
    }
    if m.tp_src != 0 {
        fields.push("tp_src");
    }
    if m.tp_dst != 0 {
        fields.push("tp_dst");
    }
    if m.metadata != 0 {
        fields.push("metadata");
    }
    if m.tunnel.tun_id != 0 {
        fields.push("tun_id");
    }
    fields.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_spec_roundtrip() {
        let flow = parse_flow_spec(
            "in_port=2,dl_src=aa:bb:cc:dd:ee:01,dl_dst=aa:bb:cc:dd:ee:02,dl_type=0x0800,\
             vlan_vid=10,nw_src=10.0.0.1,nw_dst=10.0.0.2,nw_proto=6,tp_src=1234,tp_dst=80",
        )
        .unwrap();
        assert_eq!(flow.in_port, OfPort(2));
        assert_eq!(flow.dl_src, EthAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]));
        assert_eq!(flow.dl_type, 0x0800);
        assert_eq!(flow.vlan_vid(), 10);
        assert_eq!(flow.tp_dst, 80);
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(parse_flow_spec("in_port").is_err());
        assert!(parse_flow_spec("dl_src=zz:bb:cc:dd:ee:01").is_err());
        assert!(parse_flow_spec("no_such=1").is_err());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Shared harness: one bridge over a dummy datapath, helpers to configure
//! bundles and rules and to push packets through the whole loop.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::time::Instant;

use datapath::{DummyDpif, DummyHandle, OdpPort};
use engine::{
    BondConfig, BridgeParamsBuilder, BundleConfig, Engine, FragHandling, PortSettings, VlanMode,
};
use flow::{EthAddr, OfPort};
use openflow::{FlowMod, FlowModCommand, Match, OfAction, RuleId};

pub const BR: &str = "br0";

pub struct TestSwitch {
    pub engine: Engine,
    pub dp: DummyHandle,
}

impl TestSwitch {
    pub fn new(ports: &[&str]) -> TestSwitch {
        Self::with_frag_handling(ports, FragHandling::Normal)
    }

    pub fn with_frag_handling(ports: &[&str], frag: FragHandling) -> TestSwitch {
        let dpif = DummyDpif::create("dp-test");
        let dp = dpif.handle();
        let mut engine = Engine::new();
        engine.add_backer("dummy", Box::new(dpif)).unwrap();
        engine
            .add_bridge(
                BridgeParamsBuilder::default()
                    .name(BR)
                    .backer("dummy")
                    .frag_handling(frag)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let mut sw = TestSwitch { engine, dp };
        for port in ports {
            sw.engine.add_port(BR, port, PortSettings::default()).unwrap();
        }
        sw
    }

    pub fn ofp(&self, port: &str) -> OfPort {
        self.engine.bridge(BR).unwrap().port_by_name(port).unwrap().ofp
    }

    pub fn odp(&self, port: &str) -> OdpPort {
        self.engine.bridge(BR).unwrap().port_by_name(port).unwrap().odp
    }

    /// Inject a packet on a port and run the fast path once.
    pub fn inject(&mut self, port: &str, packet: &[u8]) {
        self.dp.inject(self.odp(port), packet);
        self.engine.run_fast(Instant::now());
    }

    /// Install a lowest-priority rule sending everything to NORMAL.
    pub fn add_normal_rule(&mut self) -> RuleId {
        self.add_rule(Match::catchall(), 0, vec![OfAction::Output {
            port: OfPort::NORMAL,
            max_len: 0,
        }])
    }

    pub fn add_rule(&mut self, m: Match, priority: u16, actions: Vec<OfAction>) -> RuleId {
        self.engine
            .flow_mod(
                BR,
                FlowMod {
                    command: FlowModCommand::Add,
                    table_id: 0,
                    m,
                    priority,
                    cookie: 0,
                    idle_timeout: 0,
                    hard_timeout: 0,
                    actions,
                },
            )
            .unwrap()
            .unwrap()
    }

    pub fn access_bundle(&mut self, name: &str, ports: &[&str], vlan: u16) {
        self.bundle(name, ports, VlanMode::Access, vlan, None, None);
    }

    pub fn trunk_bundle(&mut self, name: &str, ports: &[&str], trunks: &[u16]) {
        self.bundle(name, ports, VlanMode::Trunk, 0, Some(trunks), None);
    }

    pub fn bundle(
        &mut self,
        name: &str,
        ports: &[&str],
        vlan_mode: VlanMode,
        vlan: u16,
        trunks: Option<&[u16]>,
        bond: Option<BondConfig>,
    ) {
        self.engine
            .configure_bundle(
                BR,
                BundleConfig {
                    name: name.to_string(),
                    slaves: ports.iter().map(|s| (*s).to_string()).collect(),
                    vlan_mode,
                    vlan,
                    trunks: trunks.map(|t| t.iter().copied().collect()),
                    use_priority_tags: false,
                    bond,
                    lacp: false,
                },
            )
            .unwrap();
    }

    pub fn n_facets(&self) -> usize {
        self.engine.n_facets(BR)
    }
}

pub fn mac(last: u8) -> EthAddr {
    EthAddr([0xaa, 0x55, 0, 0, 0, last])
}

pub fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

/// An untagged or tagged TCP frame between two of the `mac(n)` hosts.
pub fn tcp_packet(src: u8, dst: u8, vlan: Option<u16>) -> Vec<u8> {
    flow::packets::ipv4_tcp(
        mac(src),
        mac(dst),
        vlan.map(|v| (v, 0)),
        ip(src),
        ip(dst),
        1000 + u16::from(src),
        80,
        flow::tcp_flags::ACK,
    )
}

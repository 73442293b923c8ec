// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port-level behavior: patch ports, tunnels, STP states, special-protocol
//! interception, sFlow sampling, control commands.

mod common;

use std::net::Ipv4Addr;
use std::time::Instant;

use common::{BR, TestSwitch, mac, tcp_packet};
use datapath::{OdpAction, OdpKeyAttr, UserspaceCookie};
use engine::{
    BridgeParamsBuilder, PortSettings, SflowConfig, SlowPathReason, StpState, TunnelConfig,
};
use flow::{ETH_TYPE_SLOW, EthAddr, Flow, OfPort};
use openflow::{Match, OfAction};

/// Packets crossing a patch port are translated in the peer bridge with a
/// clean pipeline context and leave on the peer's ports.
#[test]
fn patch_port_crosses_bridges() {
    let dpif = datapath::DummyDpif::create("dp-test");
    let dp = dpif.handle();
    let mut engine = engine::Engine::new();
    engine.add_backer("dummy", Box::new(dpif)).unwrap();
    for name in ["br0", "br1"] {
        engine
            .add_bridge(
                BridgeParamsBuilder::default()
                    .name(name)
                    .backer("dummy")
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    engine.add_port("br0", "p0", PortSettings::default()).unwrap();
    engine
        .add_port("br0", "patch0", PortSettings {
            patch_peer: Some("patch1".to_string()),
            ..PortSettings::default()
        })
        .unwrap();
    engine
        .add_port("br1", "patch1", PortSettings {
            patch_peer: Some("patch0".to_string()),
            ..PortSettings::default()
        })
        .unwrap();
    engine.add_port("br1", "p1", PortSettings::default()).unwrap();

    // br0: everything to the patch. br1: everything to p1.
    let patch0 = engine.bridge("br0").unwrap().port_by_name("patch0").unwrap().ofp;
    let out1 = engine.bridge("br1").unwrap().port_by_name("p1").unwrap().ofp;
    let fm = |port: OfPort| openflow::FlowMod {
        command: openflow::FlowModCommand::Add,
        table_id: 0,
        m: Match::catchall(),
        priority: 10,
        cookie: 0,
        idle_timeout: 0,
        hard_timeout: 0,
        actions: vec![OfAction::Output { port, max_len: 0 }],
    };
    engine.flow_mod("br0", fm(patch0)).unwrap();
    engine.flow_mod("br1", fm(out1)).unwrap();

    let odp_p0 = engine.bridge("br0").unwrap().port_by_name("p0").unwrap().odp;
    let odp_p1 = engine.bridge("br1").unwrap().port_by_name("p1").unwrap().odp;
    dp.inject(odp_p0, &tcp_packet(1, 2, None));
    engine.run_fast(Instant::now());

    let sent = dp.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, odp_p1, "packet emerged from the peer bridge");
}

/// Output to a tunnel port composes a SET(tunnel) carrying the port's
/// remote endpoint and key before the output.
#[test]
fn tunnel_output_sets_metadata() {
    let mut sw = TestSwitch::new(&["p1"]);
    sw.engine
        .add_port(BR, "gre0", PortSettings {
            tunnel: Some(TunnelConfig {
                remote_ip: Ipv4Addr::new(192, 168, 1, 1),
                local_ip: None,
                out_key: Some(0x2a),
                tos: 0,
                ttl: 64,
                dont_fragment: false,
                csum: false,
            }),
            ..PortSettings::default()
        })
        .unwrap();
    let gre = sw.ofp("gre0");
    sw.add_rule(Match::catchall(), 10, vec![OfAction::Output {
        port: gre,
        max_len: 0,
    }]);

    let f = Flow {
        in_port: sw.ofp("p1"),
        dl_src: mac(1),
        dl_dst: mac(2),
        ..Flow::default()
    };
    let xout = sw.engine.xlate_flow(BR, &f, 0);
    assert_eq!(xout.odp_actions.len(), 2);
    match &xout.odp_actions[0] {
        OdpAction::Set(OdpKeyAttr::Tunnel { id, ipv4_dst, .. }) => {
            assert_eq!(*id, 0x2a);
            assert_eq!(*ipv4_dst, Ipv4Addr::new(192, 168, 1, 1));
        }
        other => panic!("expected tunnel set, got {other:?}"),
    }
    assert!(matches!(xout.odp_actions[1], OdpAction::Output(_)));
}

/// A port in STP blocking state swallows output; listening state forwards
/// nothing but still allows learning states to differ.
#[test]
fn stp_blocking_drops_output() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_rule(Match::catchall(), 10, vec![OfAction::Output {
        port: OfPort(2),
        max_len: 0,
    }]);
    sw.engine.set_stp_state(BR, "p2", StpState::Blocking).unwrap();

    let f = Flow {
        in_port: sw.ofp("p1"),
        dl_src: mac(1),
        dl_dst: mac(2),
        ..Flow::default()
    };
    let xout = sw.engine.xlate_flow(BR, &f, 0);
    assert!(xout.odp_actions.is_empty(), "blocked port emits nothing");

    // Reconfiguration to forwarding brings the output back.
    sw.engine.set_stp_state(BR, "p2", StpState::Forwarding).unwrap();
    let xout = sw.engine.xlate_flow(BR, &f, 0);
    assert_eq!(xout.odp_actions.len(), 1);
    assert!(
        sw.engine.backer("dummy").unwrap().need_revalidate.is_some(),
        "STP change marks revalidation"
    );
}

/// LACP frames on a LACP bundle are pinned to the slow path and never
/// reach the rule table.
#[test]
fn lacp_frames_intercepted() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.bundle(
        "bond0",
        &["p1"],
        engine::VlanMode::Trunk,
        0,
        None,
        Some(engine::BondConfig {
            mode: engine::BondMode::Slb,
            basis: 0,
        }),
    );
    {
        let bridge = sw.engine.bridge_mut(BR).unwrap();
        bridge.bundles.get_mut("bond0").unwrap().lacp = true;
    }

    let pkt = flow::packets::raw_eth(
        mac(1),
        EthAddr::LACP_MULTICAST,
        None,
        ETH_TYPE_SLOW,
        &[0u8; 40],
    );
    sw.inject("p1", &pkt);
    let bridge = sw.engine.bridge(BR).unwrap();
    assert_eq!(bridge.n_special, 1);
    let facet = bridge.facets.values().next().unwrap();
    assert_eq!(facet.xout.slow, SlowPathReason::LACP);
    assert!(facet.xout.odp_actions.is_empty());

    // Installed as a slow-path flow.
    let flows = sw.dp.flows();
    assert_eq!(flows.len(), 1);
    assert!(matches!(
        flows[0].actions.as_slice(),
        [OdpAction::Userspace {
            cookie: UserspaceCookie::SlowPath { .. },
            ..
        }]
    ));
}

/// sFlow: translation plants a SAMPLE action whose cookie names the
/// output port, and sampled packets come back to the collector.
#[test]
fn sflow_sampling_round_trip() {
    let dpif = datapath::DummyDpif::create("dp-test");
    let dp = dpif.handle();
    let mut engine = engine::Engine::new();
    engine.add_backer("dummy", Box::new(dpif)).unwrap();
    engine
        .add_bridge(
            BridgeParamsBuilder::default()
                .name(BR)
                .backer("dummy")
                .sflow(SflowConfig {
                    sampling_n: 1,
                    collector: "127.0.0.1:6343".to_string(),
                    agent_device: None,
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    let mut sw = TestSwitch { engine, dp };
    for p in ["p1", "p2"] {
        sw.engine.add_port(BR, p, PortSettings::default()).unwrap();
    }
    sw.add_rule(Match::catchall(), 10, vec![OfAction::Output {
        port: OfPort(2),
        max_len: 0,
    }]);

    sw.inject("p1", &tcp_packet(1, 2, None));
    // The install carries the sample wrapping a USERSPACE with the fixed-up
    // single-output cookie.
    let flows = sw.dp.flows();
    let sample = flows[0]
        .actions
        .iter()
        .find_map(|a| match a {
            OdpAction::Sample { actions, .. } => actions.first(),
            _ => None,
        })
        .expect("sample action installed");
    match sample {
        OdpAction::Userspace {
            cookie: UserspaceCookie::Sflow { output, .. },
            ..
        } => assert_eq!(*output, sw.odp("p2").0),
        other => panic!("expected sflow cookie, got {other:?}"),
    }

    // Forward another packet through the datapath: the sample comes back
    // as an ACTION upcall and lands in the agent.
    sw.inject("p1", &tcp_packet(1, 2, None));
    sw.engine.run_fast(Instant::now());
    let p2 = sw.odp("p2");
    let bridge = sw.engine.bridge_mut(BR).unwrap();
    let agent = bridge.sflow.as_mut().unwrap();
    assert!(agent.n_samples >= 1);
    let samples = agent.take_samples();
    assert!(!samples.is_empty());
    assert_eq!(samples[0].output, Some(p2));
}

/// Control commands: dpif/show lists the bridge, trace explains a flow,
/// fdb/flush empties the table.
#[test]
fn control_commands() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.access_bundle("bundle-a", &["p1"], 10);
    sw.access_bundle("bundle-b", &["p2"], 10);
    sw.add_normal_rule();
    sw.inject("p1", &tcp_packet(1, 2, None));

    let show = sw.engine.handle_ctl("dpif/show").unwrap();
    assert!(show.contains("br0"));
    assert!(show.contains("missed:1"));

    let fdb = sw.engine.handle_ctl("fdb/show br0").unwrap();
    assert!(fdb.contains("bundle-a"));

    let trace = sw
        .engine
        .handle_ctl("trace br0 in_port=1,dl_src=aa:55:00:00:00:01,dl_dst=aa:55:00:00:00:02")
        .unwrap();
    assert!(trace.contains("Datapath actions:"));

    let dump = sw.engine.handle_ctl("dpif/dump-megaflows br0").unwrap();
    assert!(dump.contains("mask:"));

    sw.engine.handle_ctl("fdb/flush br0").unwrap();
    assert!(sw.engine.bridge(BR).unwrap().ml.is_empty());

    let check = sw.engine.handle_ctl("ofproto/self-check").unwrap();
    assert!(check.contains("consistent"));

    assert!(sw.engine.handle_ctl("no/such-command").is_err());
}

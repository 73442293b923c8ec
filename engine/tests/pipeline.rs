// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pipeline semantics: fragment policy, resubmit bounds, learn actions,
//! packet-ins, wildcard soundness.

mod common;

use std::time::Instant;

use common::{BR, TestSwitch, mac, tcp_packet};
use engine::{FragHandling, PacketInReason, SlowPathReason};
use flow::{ETH_TYPE_IP, EthAddr, Flow, FlowFrag, OfPort};
use openflow::{
    LearnDst, LearnFieldSpec, LearnSpec, LearnSrc, Match, MetaField, OfAction, RuleKind, Subfield,
};

fn match_on_dst(dst: EthAddr) -> Match {
    let mut m = Match::catchall();
    m.flow.dl_dst = dst;
    m.wc.masks.dl_dst = EthAddr::BROADCAST;
    m
}

/// Fragment in Drop mode: the synthetic drop-frags rule wins, actions are
/// empty, wildcards exact.
#[test]
fn fragment_drop_mode() {
    let mut sw = TestSwitch::with_frag_handling(&["p1", "p2"], FragHandling::Drop);
    sw.add_normal_rule();

    let frag = Flow {
        in_port: sw.ofp("p1"),
        dl_src: mac(1),
        dl_dst: mac(2),
        dl_type: ETH_TYPE_IP,
        nw_proto: 17,
        nw_frag: FlowFrag::ANY | FlowFrag::LATER,
        ..Flow::default()
    };
    let xout = sw.engine.xlate_flow(BR, &frag, 0);
    assert!(xout.odp_actions.is_empty());
    assert!(xout.wc.is_exact());
    let bridge = sw.engine.bridge(BR).unwrap();
    let rule = bridge.rules.rule(xout.rule.unwrap()).unwrap();
    assert_eq!(rule.kind, RuleKind::DropFrags);

    // End to end: the fragment is dropped, nothing sent.
    let pkt = flow::packets::ipv4_fragment(mac(1), mac(2), common::ip(1), common::ip(2), 64, false);
    sw.inject("p1", &pkt);
    assert!(sw.dp.take_sent().is_empty());
}

/// A rule that resubmits to its own table forever trips the recursion
/// bound: empty actions, trigger flag, slow-path install.
#[test]
fn resubmit_loop_hits_bound() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_rule(Match::catchall(), 10, vec![OfAction::Resubmit {
        port: None,
        table: Some(0),
    }]);

    let f = Flow {
        in_port: sw.ofp("p1"),
        dl_src: mac(1),
        dl_dst: mac(2),
        ..Flow::default()
    };
    let xout = sw.engine.xlate_flow(BR, &f, 0);
    assert!(xout.max_resubmit_triggered);
    assert!(xout.odp_actions.is_empty());
    assert!(!xout.slow.is_empty());

    // A real packet installs the flow on the slow path.
    sw.inject("p1", &tcp_packet(1, 2, None));
    let flows = sw.dp.flows();
    assert_eq!(flows.len(), 1);
    assert!(
        matches!(
            flows[0].actions.as_slice(),
            [datapath::OdpAction::Userspace { .. }]
        ),
        "slow-path install is a lone userspace action"
    );
}

/// GotoTable must be strictly increasing; a matching rule in the later
/// table executes.
#[test]
fn goto_table_strictly_increasing() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_rule(Match::catchall(), 10, vec![OfAction::GotoTable(2)]);
    sw.engine
        .flow_mod(
            BR,
            openflow::FlowMod {
                command: openflow::FlowModCommand::Add,
                table_id: 2,
                m: Match::catchall(),
                priority: 0,
                cookie: 0,
                idle_timeout: 0,
                hard_timeout: 0,
                actions: vec![OfAction::Output {
                    port: OfPort(2),
                    max_len: 0,
                }],
            },
        )
        .unwrap();

    sw.inject("p1", &tcp_packet(1, 2, None));
    let sent = sw.dp.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, sw.odp("p2"));
}

/// The learn action posts a flow mod built from the current flow; the
/// learned rule then steers the reverse direction.
#[test]
fn learn_action_builds_reverse_path() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    // Table 0: learn "packets to my source MAC go out my ingress port",
    // then flood.
    let learn = LearnSpec {
        table_id: 1,
        priority: 100,
        cookie: 0xbeef,
        idle_timeout: 0,
        hard_timeout: 0,
        fin_idle_timeout: 0,
        fin_hard_timeout: 0,
        specs: vec![
            LearnFieldSpec {
                src: LearnSrc::Field(Subfield::full(MetaField::EthSrc)),
                dst: LearnDst::Match(Subfield::full(MetaField::EthDst)),
            },
            LearnFieldSpec {
                src: LearnSrc::Field(Subfield::full(MetaField::InPort)),
                dst: LearnDst::Output,
            },
        ],
    };
    sw.add_rule(Match::catchall(), 10, vec![
        OfAction::Learn(Box::new(learn)),
        OfAction::Resubmit {
            port: None,
            table: Some(1),
        },
    ]);
    // Table 1 default: flood.
    sw.engine
        .flow_mod(
            BR,
            openflow::FlowMod {
                command: openflow::FlowModCommand::Add,
                table_id: 1,
                m: Match::catchall(),
                priority: 0,
                cookie: 0,
                idle_timeout: 0,
                hard_timeout: 0,
                actions: vec![OfAction::Output {
                    port: OfPort::FLOOD,
                    max_len: 0,
                }],
            },
        )
        .unwrap();

    // Host 1 talks: its reverse path is learned into table 1.
    sw.inject("p1", &tcp_packet(1, 2, None));
    sw.dp.take_sent();
    assert_eq!(
        sw.engine.bridge(BR).unwrap().rules.n_rules(),
        3,
        "two seed rules plus the learned one"
    );

    // Reverse traffic hits the learned rule: unicast to p1, not flood.
    sw.inject("p2", &tcp_packet(2, 1, None));
    let sent = sw.dp.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, sw.odp("p1"));
}

/// With no rules at all, the synthetic miss rule forwards to the
/// controller: a packet-in with reason NoMatch, and a slow-path facet.
#[test]
fn miss_rule_sends_packet_in() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.inject("p1", &tcp_packet(1, 2, None));

    let pins = sw.engine.bridge_mut(BR).unwrap().take_packet_ins();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].reason, PacketInReason::NoMatch);
    assert_eq!(pins[0].flow.dl_src, mac(1));

    // The facet is cached slow-path: the next packet comes back up and
    // produces another packet-in.
    let bridge = sw.engine.bridge(BR).unwrap();
    let facet = bridge.facets.values().next().unwrap();
    assert!(facet.xout.slow.contains(SlowPathReason::CONTROLLER));

    sw.inject("p1", &tcp_packet(1, 2, None));
    let pins = sw.engine.bridge_mut(BR).unwrap().take_packet_ins();
    assert_eq!(pins.len(), 1, "every slow-path packet reaches the controller");
}

/// Wildcard soundness: packets agreeing on all masked bits translate to
/// the same actions.
#[test]
fn wildcard_soundness() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_rule(match_on_dst(mac(2)), 10, vec![OfAction::Output {
        port: OfPort(2),
        max_len: 0,
    }]);

    let base = Flow {
        in_port: sw.ofp("p1"),
        dl_src: mac(1),
        dl_dst: mac(2),
        dl_type: ETH_TYPE_IP,
        nw_proto: 6,
        nw_src: common::ip(1).into(),
        nw_dst: common::ip(2).into(),
        tp_src: 1000,
        tp_dst: 80,
        nw_ttl: 64,
        ..Flow::default()
    };
    let out_a = sw.engine.xlate_flow(BR, &base, 0);

    // Vary only fields the translation never read.
    let mut other = base;
    other.nw_src = common::ip(77).into();
    other.tp_src = 4242;
    other.tp_dst = 443;
    assert!(
        out_a.wc.flow_equal_except(&base, &other),
        "varied fields must be wildcarded"
    );
    let out_b = sw.engine.xlate_flow(BR, &other, 0);
    assert_eq!(out_a.odp_actions, out_b.odp_actions);
    assert_eq!(out_a.slow, out_b.slow);

    // A field the rule matched is not wildcarded.
    let mut third = base;
    third.dl_dst = mac(9);
    assert!(!out_a.wc.flow_equal_except(&base, &third));
}

/// Direct execution equals install-then-forward: the first (miss) packet
/// and a later datapath-forwarded packet leave on the same ports.
#[test]
fn execute_equals_datapath_forwarding() {
    let mut sw = TestSwitch::new(&["p1", "p2", "p3"]);
    sw.access_bundle("bundle-a", &["p1"], 10);
    sw.access_bundle("bundle-b", &["p2"], 10);
    sw.trunk_bundle("trunk", &["p3"], &[10]);
    sw.add_normal_rule();

    sw.inject("p1", &tcp_packet(1, 2, None));
    let mut first: Vec<_> = sw.dp.take_sent().iter().map(|s| (s.port, s.vlan_tci)).collect();
    first.sort_unstable();

    sw.inject("p1", &tcp_packet(1, 2, None));
    let mut second: Vec<_> = sw.dp.take_sent().iter().map(|s| (s.port, s.vlan_tci)).collect();
    second.sort_unstable();

    assert_eq!(first, second);
    assert_eq!(sw.engine.bridge(BR).unwrap().n_missed, 1, "second packet never missed");
}

/// WriteMetadata + resubmit: metadata written in table 0 is matchable in
/// table 1, and the metadata bits end up in the wildcards.
#[test]
fn write_metadata_and_match() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_rule(Match::catchall(), 10, vec![
        OfAction::WriteMetadata {
            value: 0x5a,
            mask: 0xff,
        },
        OfAction::Resubmit {
            port: None,
            table: Some(1),
        },
    ]);
    let mut m = Match::catchall();
    m.flow.metadata = 0x5a;
    m.wc.masks.metadata = 0xff;
    sw.engine
        .flow_mod(
            BR,
            openflow::FlowMod {
                command: openflow::FlowModCommand::Add,
                table_id: 1,
                m,
                priority: 10,
                cookie: 0,
                idle_timeout: 0,
                hard_timeout: 0,
                actions: vec![OfAction::Output {
                    port: OfPort(2),
                    max_len: 0,
                }],
            },
        )
        .unwrap();

    sw.inject("p1", &tcp_packet(1, 2, None));
    let sent = sw.dp.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, sw.odp("p2"));
}

/// Clogged mode defers learn-driven rule mods until the engine is
/// unclogged; the datapath side of the triggering packet still happened.
#[test]
fn clogged_defers_learned_rules() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    let learn = LearnSpec {
        table_id: 1,
        priority: 100,
        cookie: 0,
        idle_timeout: 0,
        hard_timeout: 0,
        fin_idle_timeout: 0,
        fin_hard_timeout: 0,
        specs: vec![LearnFieldSpec {
            src: LearnSrc::Field(Subfield::full(MetaField::EthSrc)),
            dst: LearnDst::Match(Subfield::full(MetaField::EthDst)),
        }],
    };
    sw.add_rule(Match::catchall(), 10, vec![
        OfAction::Learn(Box::new(learn)),
        OfAction::Output {
            port: OfPort(2),
            max_len: 0,
        },
    ]);

    sw.engine.clogged = true;
    sw.inject("p1", &tcp_packet(1, 2, None));
    // The packet was still forwarded...
    assert_eq!(sw.dp.take_sent().len(), 1);
    // ...but the learned rule is not visible yet.
    assert_eq!(sw.engine.bridge(BR).unwrap().rules.n_rules(), 1);

    sw.engine.clogged = false;
    sw.engine.run(Instant::now());
    assert_eq!(sw.engine.bridge(BR).unwrap().rules.n_rules(), 2);
}

/// While flow_restore_wait is set, upcalls stay queued and the periodic
/// work is suspended.
#[test]
fn flow_restore_wait_suspends_processing() {
    let mut sw = TestSwitch::new(&["p1", "p2"]);
    sw.add_normal_rule();
    sw.engine.flow_restore_wait = true;

    sw.dp.inject(sw.odp("p1"), &tcp_packet(1, 2, None));
    assert_eq!(sw.engine.run_fast(Instant::now()), 0);
    assert_eq!(sw.dp.pending_upcalls(), 1, "upcall left queued");
    assert_eq!(sw.n_facets(), 0);

    sw.engine.flow_restore_wait = false;
    assert_eq!(sw.engine.run_fast(Instant::now()), 1);
    assert_eq!(sw.n_facets(), 1);
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! # Flow translation and flow-cache engine
//!
//! The userspace half of a datapath-backed OpenFlow switch: receives
//! packet-miss upcalls, translates them through the rule pipeline into
//! datapath actions, installs masked datapath flows so later packets stay
//! in the fast path, pulls counters back up into rules / NetFlow / mirrors,
//! and revalidates or expires the cached translations as configuration
//! changes.
//!
//! The [`Engine`] value owns everything; construct one, give it a backer
//! (a [`datapath::Dpif`]), bridges, ports and rules, then drive it with
//! [`Engine::run`] and [`Engine::run_fast`] from a poll loop.

#![allow(clippy::similar_names)]

mod bridge;
mod bundle;
mod ctl;
mod engine;
mod expire;
mod facet;
mod ipfix;
mod mac;
mod mirror;
mod netflow;
mod port;
mod reval;
mod sflow;
mod stats;
mod upcall;
mod util;
mod xlate;

pub use bridge::{Bridge, DEFAULT_MISS_SEND_LEN, FragHandling, PacketIn};
pub use openflow::PacketInReason;
pub use bundle::{BondConfig, BondMode, Bundle, BundleConfig, VlanMode, VlanSet};
pub use ctl::CtlError;
pub use engine::{
    Backer, BridgeParams, BridgeParamsBuilder, Engine, EngineError, EXPIRE_INTERVAL,
    FLOW_EVICTION_THRESHOLD, MAX_BATCH, RUN_FAST_INTERVAL, RevalReason, STATS_PULL_INTERVAL,
};
pub use expire::{
    BUCKET_WIDTH, DP_MAX_IDLE, N_BUCKETS, SPECIAL_CUTOFF, SUBFACET_DESTROY_MAX_BATCH,
};
pub use facet::{Facet, Governor, Subfacet, SubfacetPath};
pub use ipfix::{IpfixAgent, IpfixConfig, IpfixRecord};
pub use mac::{GRAT_ARP_LOCK, MAC_ENTRY_IDLE, MacEntry, MacLearning};
pub use mirror::{MAX_MIRRORS, Mirror, MirrorConfig, MirrorMask};
pub use netflow::{NetFlow, NetFlowConfig, NetFlowRecord, NfOutput};
pub use port::{Port, PortFlags, PortSettings, StpState, TunnelConfig};
pub use sflow::{SflowAgent, SflowConfig, SflowSample};
pub use stats::{AddDelRate, Ewma, SubfacetRates};
pub use xlate::{
    MAX_RESUBMIT_RECURSION, ResubmitStats, SlowPathReason, XlateIn, XlateOut, xlate_actions,
};

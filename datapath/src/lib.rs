// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(unsafe_code)]

//! # Datapath interface
//!
//! The fast path is an external component reached through the [`Dpif`]
//! trait: it parses packets it cannot forward into netlink-attribute-shaped
//! flow keys and hands them up as [`Upcall`]s; userspace answers with batched
//! flow installs, deletions and one-shot packet executions.
//!
//! [`DummyDpif`] is a complete in-memory datapath used by the tests and the
//! reference daemon: it installs masked flows, forwards injected packets
//! through them, and queues upcalls for misses and userspace actions.

mod action;
mod commit;
mod dpif;
mod dummy;
mod key;

pub use action::{
    OdpAction, SFLOW_COOKIE_MULTIPLE_OUTPUTS, SLOW_PATH_CFM, SLOW_PATH_CONTROLLER, SLOW_PATH_LACP,
    SLOW_PATH_STP, UserspaceCookie,
};
pub use commit::commit_odp_actions;
pub use dpif::{
    DpError, DpFlowEntry, DpOp, Dpif, ExecuteOp, FlowDel, FlowPut, FlowStats, OpResult, PutFlags,
    Upcall, UpcallKind,
};
pub use dummy::{DummyDpif, DummyHandle, SentPacket};
pub use key::{OdpFitness, OdpFlowKey, OdpFrag, OdpKeyAttr, OdpPort, flow_to_key, key_to_flow};

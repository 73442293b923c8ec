// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;

use crate::action::{OdpAction, UserspaceCookie};
use crate::key::{OdpFlowKey, OdpPort};
use flow::Wildcards;

/// Errno-shaped datapath errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DpError {
    /// Nothing available right now; try again later.
    #[error("resource temporarily unavailable")]
    Again,
    /// A referenced port does not exist.
    #[error("no such device")]
    NoDevice,
    /// A referenced flow does not exist.
    #[error("no such flow")]
    NotFound,
    /// Flow already installed and the put did not allow modification.
    #[error("flow exists")]
    Exists,
    /// The datapath dropped notifications because its queues overflowed.
    #[error("no buffer space available")]
    BufferFull,
    /// The request was malformed (unparseable key, bad action).
    #[error("invalid argument")]
    Invalid,
}

/// Counters a datapath keeps per installed flow.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct FlowStats {
    pub n_packets: u64,
    pub n_bytes: u64,
    pub used: Option<Instant>,
    pub tcp_flags: u8,
}

/// Why the datapath sent a packet up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpcallKind {
    /// No installed flow matched.
    Miss,
    /// A USERSPACE action fired.
    Action,
}

/// A packet handed up from the datapath.
#[derive(Clone, Debug)]
pub struct Upcall {
    pub kind: UpcallKind,
    pub packet: Bytes,
    /// The datapath's own flow key for the packet.
    pub key: OdpFlowKey,
    /// Userdata of the USERSPACE action, for [`UpcallKind::Action`].
    pub userdata: Option<UserspaceCookie>,
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PutFlags: u8 {
        /// Install if absent.
        const CREATE = 0x01;
        /// Replace if present.
        const MODIFY = 0x02;
        /// Reset counters if replacing.
        const ZERO_STATS = 0x04;
    }
}

/// Install (or modify) one datapath flow.
#[derive(Clone, Debug)]
pub struct FlowPut {
    pub flags: PutFlags,
    pub key: OdpFlowKey,
    /// Match mask; `None` means exact match on the key.
    pub mask: Option<Wildcards>,
    pub actions: Vec<OdpAction>,
}

/// Delete one datapath flow; the reply carries its final counters.
#[derive(Clone, Debug)]
pub struct FlowDel {
    pub key: OdpFlowKey,
}

/// Run actions on one packet without installing anything.
#[derive(Clone, Debug)]
pub struct ExecuteOp {
    pub key: OdpFlowKey,
    pub packet: Bytes,
    pub actions: Vec<OdpAction>,
}

/// One element of a batched `operate` call.
#[derive(Clone, Debug)]
pub enum DpOp {
    FlowPut(FlowPut),
    FlowDel(FlowDel),
    Execute(ExecuteOp),
}

/// Per-op outcome. Only deletions return counters.
pub type OpResult = Result<Option<FlowStats>, DpError>;

/// One flow from a full-table dump.
#[derive(Clone, Debug)]
pub struct DpFlowEntry {
    pub key: OdpFlowKey,
    pub mask: Option<Wildcards>,
    pub actions: Vec<OdpAction>,
    pub stats: FlowStats,
}

/// The abstract fast path.
///
/// Everything here is non-blocking: `recv` returns `Ok(None)` when no upcall
/// is pending, and `operate` reports per-op errors without aborting the
/// batch. Ops touching the same key are applied in submission order.
pub trait Dpif {
    fn name(&self) -> &str;

    fn port_add(&mut self, name: &str) -> Result<OdpPort, DpError>;
    fn port_del(&mut self, port: OdpPort) -> Result<(), DpError>;
    fn port_name(&self, port: OdpPort) -> Option<String>;

    /// Every port on the datapath.
    fn port_dump(&self) -> Vec<(OdpPort, String)>;

    /// Map an OpenFlow queue id to a datapath priority value.
    fn queue_to_priority(&self, queue_id: u32) -> Result<u32, DpError>;

    /// Next pending upcall, if any.
    fn recv(&mut self) -> Result<Option<Upcall>, DpError>;

    /// Submit a batch of flow/packet operations.
    fn operate(&mut self, ops: Vec<DpOp>) -> Vec<OpResult>;

    /// Dump every installed flow with its counters.
    fn flow_dump(&mut self) -> Vec<DpFlowEntry>;

    /// Fetch one installed flow.
    fn flow_get(&self, key: &OdpFlowKey) -> Result<DpFlowEntry, DpError>;

    /// Delete every installed flow.
    fn flow_flush(&mut self);

    /// Number of installed flows.
    fn n_flows(&self) -> usize;

    /// Periodic internal housekeeping; most datapaths need none.
    fn run(&mut self) {}

    /// Register interest in the next poll wakeup; most datapaths need none.
    fn wait(&mut self) {}
}

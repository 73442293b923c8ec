// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::key::{OdpKeyAttr, OdpPort};

/// Slow-path reason bits carried in a [`UserspaceCookie::SlowPath`] cookie.
pub const SLOW_PATH_CFM: u16 = 1 << 0;
pub const SLOW_PATH_LACP: u16 = 1 << 1;
pub const SLOW_PATH_STP: u16 = 1 << 2;
pub const SLOW_PATH_CONTROLLER: u16 = 1 << 3;

/// Set in the sFlow cookie's `output` field when a sampled flow has more
/// than one output; the low bits then carry the output count.
pub const SFLOW_COOKIE_MULTIPLE_OUTPUTS: u32 = 0x8000_0000;

/// Typed userdata attached to a USERSPACE action. A real datapath sees only
/// an opaque byte string; the length+prefix shapes it would carry are modeled
/// as variants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UserspaceCookie {
    /// The flow must keep being handled in userspace; the bits say why.
    SlowPath { reason: u16 },
    /// sFlow sample: VLAN TCI at sampling time plus the output port, or an
    /// output count when [`SFLOW_COOKIE_MULTIPLE_OUTPUTS`] is set.
    Sflow { vlan_tci: u16, output: u32 },
    /// Per-flow IPFIX sample emitted by an OpenFlow Sample action.
    FlowSample {
        probability: u16,
        collector_set_id: u32,
        obs_domain_id: u32,
        obs_point_id: u32,
    },
    /// Bridge-wide IPFIX sample.
    IpfixBridge,
}

/// One datapath action.
#[derive(Clone, PartialEq, Debug)]
pub enum OdpAction {
    Output(OdpPort),
    Userspace { pid: u32, cookie: UserspaceCookie },
    PushVlan { tpid: u16, tci: u16 },
    PopVlan,
    PushMpls { ethertype: u16, lse: u32 },
    PopMpls { ethertype: u16 },
    /// Rewrite the header fields named by the nested key attribute.
    Set(OdpKeyAttr),
    Sample { probability: u32, actions: Vec<OdpAction> },
}

impl OdpAction {
    /// Number of Output actions, including inside samples.
    #[must_use]
    pub fn count_outputs(actions: &[OdpAction]) -> usize {
        actions
            .iter()
            .map(|a| match a {
                OdpAction::Output(_) => 1,
                OdpAction::Sample { actions, .. } => Self::count_outputs(actions),
                _ => 0,
            })
            .sum()
    }

    /// The only action list installed for slow-path flows: hand every packet
    /// to userspace with the reason attached.
    #[must_use]
    pub fn slow_path(pid: u32, reason: u16) -> Vec<OdpAction> {
        vec![OdpAction::Userspace {
            pid,
            cookie: UserspaceCookie::SlowPath { reason },
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outputs_through_samples() {
        let actions = vec![
            OdpAction::Output(OdpPort(1)),
            OdpAction::Sample {
                probability: u32::MAX,
                actions: vec![OdpAction::Output(OdpPort(2))],
            },
            OdpAction::PopVlan,
        ];
        assert_eq!(OdpAction::count_outputs(&actions), 2);
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::net::Ipv4Addr;

use bitflags::bitflags;
use datapath::OdpPort;
use flow::OfPort;

bitflags! {
    /// OpenFlow port config bits the translation consults.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
    pub struct PortFlags: u32 {
        /// Never forward out of this port.
        const NO_FWD = 0x01;
        /// Suppress packet-ins for packets arriving here.
        const NO_PACKET_IN = 0x02;
        /// Exclude from FLOOD and NORMAL flooding.
        const NO_FLOOD = 0x04;
    }
}

/// Spanning-tree state of a port. `Disabled` means STP is not running on
/// the port, which forwards and learns like `Forwarding`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub enum StpState {
    #[default]
    Disabled,
    Listening,
    Learning,
    Forwarding,
    Blocking,
}

impl StpState {
    #[must_use]
    pub fn forwards(self) -> bool {
        matches!(self, StpState::Disabled | StpState::Forwarding)
    }

    #[must_use]
    pub fn learns(self) -> bool {
        matches!(
            self,
            StpState::Disabled | StpState::Learning | StpState::Forwarding
        )
    }
}

/// Static tunnel configuration of a tunnel port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TunnelConfig {
    pub remote_ip: Ipv4Addr,
    pub local_ip: Option<Ipv4Addr>,
    /// Tunnel key; `None` inherits the flow's current key.
    pub out_key: Option<u64>,
    pub tos: u8,
    pub ttl: u8,
    pub dont_fragment: bool,
    pub csum: bool,
}

/// Configuration handed in when a port is added.
#[derive(Clone, Debug, Default)]
pub struct PortSettings {
    pub flags: PortFlags,
    pub stp_state: StpState,
    /// Name of the peer port (in any bridge) for patch ports.
    pub patch_peer: Option<String>,
    pub tunnel: Option<TunnelConfig>,
    /// CFM maintenance point configured here.
    pub cfm: bool,
}

/// One OpenFlow port of a bridge.
#[derive(Clone, Debug)]
pub struct Port {
    pub ofp: OfPort,
    pub odp: OdpPort,
    pub name: String,
    pub flags: PortFlags,
    pub stp_state: StpState,
    pub patch_peer: Option<String>,
    pub tunnel: Option<TunnelConfig>,
    pub cfm: bool,
    /// Bundle this port belongs to, if any.
    pub bundle: Option<String>,
}

impl Port {
    #[must_use]
    pub fn is_patch(&self) -> bool {
        self.patch_peer.is_some()
    }

    #[must_use]
    pub fn may_flood(&self) -> bool {
        !self.flags.contains(PortFlags::NO_FLOOD) && self.stp_state.forwards()
    }
}

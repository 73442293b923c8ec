// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Meta-field registry.
//!
//! Register moves, loads, stack operations, multipath and learn actions all
//! name flow fields symbolically and operate on bit ranges within them. Each
//! nameable field knows how to read itself out of a [`Flow`] (widened to
//! `u64`), write itself back, and mark itself in a wildcard mask.

use std::net::Ipv4Addr;

use flow::{EthAddr, Flow, OfPort, Wildcards};

/// A field of the flow addressable by register-style actions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MetaField {
    TunnelId,
    Metadata,
    InPort,
    Reg(u8),
    EthSrc,
    EthDst,
    EthType,
    VlanTci,
    IpSrc,
    IpDst,
    IpProto,
    IpTos,
    TpSrc,
    TpDst,
}

fn eth_to_u64(addr: EthAddr) -> u64 {
    let mut out = 0u64;
    for b in addr.0 {
        out = out << 8 | u64::from(b);
    }
    out
}

fn u64_to_eth(value: u64) -> EthAddr {
    let mut out = [0u8; 6];
    for (i, b) in out.iter_mut().enumerate() {
        *b = (value >> ((5 - i) * 8)) as u8;
    }
    EthAddr(out)
}

impl MetaField {
    /// Width of the field in bits.
    #[must_use]
    pub fn n_bits(self) -> u16 {
        match self {
            MetaField::TunnelId | MetaField::Metadata => 64,
            MetaField::EthSrc | MetaField::EthDst => 48,
            MetaField::Reg(_) | MetaField::IpSrc | MetaField::IpDst => 32,
            MetaField::InPort | MetaField::EthType | MetaField::VlanTci => 16,
            MetaField::TpSrc | MetaField::TpDst => 16,
            MetaField::IpProto | MetaField::IpTos => 8,
        }
    }

    /// Read the field, widened to 64 bits.
    #[must_use]
    pub fn read(self, flow: &Flow) -> u64 {
        match self {
            MetaField::TunnelId => flow.tunnel.tun_id,
            MetaField::Metadata => flow.metadata,
            MetaField::InPort => u64::from(flow.in_port.0),
            MetaField::Reg(i) => u64::from(flow.regs[usize::from(i) % flow::FLOW_N_REGS]),
            MetaField::EthSrc => eth_to_u64(flow.dl_src),
            MetaField::EthDst => eth_to_u64(flow.dl_dst),
            MetaField::EthType => u64::from(flow.dl_type),
            MetaField::VlanTci => u64::from(flow.vlan_tci),
            MetaField::IpSrc => u64::from(u32::from(flow.nw_src)),
            MetaField::IpDst => u64::from(u32::from(flow.nw_dst)),
            MetaField::IpProto => u64::from(flow.nw_proto),
            MetaField::IpTos => u64::from(flow.nw_tos),
            MetaField::TpSrc => u64::from(flow.tp_src),
            MetaField::TpDst => u64::from(flow.tp_dst),
        }
    }

    /// Write the field, truncating to its width.
    pub fn write(self, flow: &mut Flow, value: u64) {
        match self {
            MetaField::TunnelId => flow.tunnel.tun_id = value,
            MetaField::Metadata => flow.metadata = value,
            MetaField::InPort => flow.in_port = OfPort(value as u16),
            MetaField::Reg(i) => flow.regs[usize::from(i) % flow::FLOW_N_REGS] = value as u32,
            MetaField::EthSrc => flow.dl_src = u64_to_eth(value),
            MetaField::EthDst => flow.dl_dst = u64_to_eth(value),
            MetaField::EthType => flow.dl_type = value as u16,
            MetaField::VlanTci => flow.vlan_tci = value as u16,
            MetaField::IpSrc => flow.nw_src = Ipv4Addr::from(value as u32),
            MetaField::IpDst => flow.nw_dst = Ipv4Addr::from(value as u32),
            MetaField::IpProto => flow.nw_proto = value as u8,
            MetaField::IpTos => flow.nw_tos = value as u8,
            MetaField::TpSrc => flow.tp_src = value as u16,
            MetaField::TpDst => flow.tp_dst = value as u16,
        }
    }
}

/// A bit range within a meta-field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Subfield {
    pub field: MetaField,
    pub ofs: u16,
    pub n_bits: u16,
}

impl Subfield {
    /// The whole field.
    #[must_use]
    pub fn full(field: MetaField) -> Subfield {
        Subfield {
            field,
            ofs: 0,
            n_bits: field.n_bits(),
        }
    }

    fn value_mask(&self) -> u64 {
        if self.n_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.n_bits) - 1
        }
    }

    #[must_use]
    pub fn read(&self, flow: &Flow) -> u64 {
        (self.field.read(flow) >> self.ofs) & self.value_mask()
    }

    pub fn write(&self, flow: &mut Flow, value: u64) {
        let mask = self.value_mask() << self.ofs;
        let cur = self.field.read(flow);
        let new = (cur & !mask) | ((value << self.ofs) & mask);
        self.field.write(flow, new);
    }

    /// Record in the wildcard mask that exactly these bits were read.
    pub fn mark(&self, wc: &mut Wildcards) {
        let cur = self.field.read(&wc.masks);
        self.field
            .write(&mut wc.masks, cur | (self.value_mask() << self.ofs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_subfield_roundtrip() {
        let mut f = Flow::default();
        let sf = Subfield {
            field: MetaField::Reg(2),
            ofs: 8,
            n_bits: 12,
        };
        sf.write(&mut f, 0xabc);
        assert_eq!(f.regs[2], 0x000a_bc00);
        assert_eq!(sf.read(&f), 0xabc);
    }

    #[test]
    fn write_preserves_surrounding_bits() {
        let mut f = Flow {
            regs: [0xffff_ffff, 0, 0, 0, 0, 0, 0, 0],
            ..Flow::default()
        };
        let sf = Subfield {
            field: MetaField::Reg(0),
            ofs: 4,
            n_bits: 8,
        };
        sf.write(&mut f, 0);
        assert_eq!(f.regs[0], 0xffff_f00f);
    }

    #[test]
    fn eth_field_roundtrip() {
        let mut f = Flow::default();
        let addr = EthAddr([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        MetaField::EthSrc.write(&mut f, eth_to_u64(addr));
        assert_eq!(f.dl_src, addr);
        assert_eq!(MetaField::EthSrc.read(&f), 0x0102_0304_0506);
    }

    #[test]
    fn mark_sets_only_read_bits() {
        let mut wc = Wildcards::catchall();
        let sf = Subfield {
            field: MetaField::VlanTci,
            ofs: 0,
            n_bits: 12,
        };
        sf.mark(&mut wc);
        assert_eq!(wc.masks.vlan_tci, 0x0fff);
    }

    #[test]
    fn full_subfield_covers_field() {
        let sf = Subfield::full(MetaField::EthDst);
        assert_eq!(sf.n_bits, 48);
        let mut wc = Wildcards::catchall();
        sf.mark(&mut wc);
        assert_eq!(wc.masks.dl_dst, EthAddr::BROADCAST);
    }
}

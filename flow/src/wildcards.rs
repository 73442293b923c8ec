// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::flow::{FLOW_WORDS, Flow};
use crate::hash::hash_words;

/// Per-bit "does this matter" record, the same shape as [`Flow`].
///
/// A set bit means the corresponding flow bit was read while translating and
/// therefore matters to the result; a clear bit means "don't care". The
/// translation contract: two packets that agree on every set bit translate to
/// the same actions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Wildcards {
    pub masks: Flow,
}

impl Wildcards {
    /// Everything wildcarded; matches any packet.
    #[must_use]
    pub fn catchall() -> Wildcards {
        Wildcards {
            masks: Flow::default(),
        }
    }

    /// Nothing wildcarded; matches exactly one packet fingerprint.
    #[must_use]
    pub fn exact() -> Wildcards {
        Wildcards {
            masks: Flow::from_words(&[u32::MAX; FLOW_WORDS]),
        }
    }

    #[must_use]
    pub fn is_catchall(&self) -> bool {
        self.masks.to_words() == [0; FLOW_WORDS]
    }

    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.masks.to_words() == [u32::MAX; FLOW_WORDS]
    }

    /// Intersection: wildcarded in the result iff wildcarded in either input.
    #[must_use]
    pub fn combine(&self, other: &Wildcards) -> Wildcards {
        let a = self.masks.to_words();
        let b = other.masks.to_words();
        let mut out = [0u32; FLOW_WORDS];
        for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
            *o = x & y;
        }
        Wildcards {
            masks: Flow::from_words(&out),
        }
    }

    /// Accumulate: every bit that matters to `other` also matters to `self`.
    pub fn fold(&mut self, other: &Wildcards) {
        let a = self.masks.to_words();
        let b = other.masks.to_words();
        let mut out = [0u32; FLOW_WORDS];
        for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
            *o = x | y;
        }
        self.masks = Flow::from_words(&out);
    }

    /// Do `a` and `b` agree on every bit that matters?
    #[must_use]
    pub fn flow_equal_except(&self, a: &Flow, b: &Flow) -> bool {
        let aw = a.to_words();
        let bw = b.to_words();
        let mw = self.masks.to_words();
        aw.iter()
            .zip(bw.iter())
            .zip(mw.iter())
            .all(|((x, y), m)| x & m == y & m)
    }

    /// Hash of the flow bits that matter.
    #[must_use]
    pub fn hash_flow(&self, flow: &Flow, basis: u32) -> u32 {
        let fw = flow.to_words();
        let mw = self.masks.to_words();
        let mut masked = [0u32; FLOW_WORDS];
        for (o, (f, m)) in masked.iter_mut().zip(fw.iter().zip(mw.iter())) {
            *o = f & m;
        }
        hash_words(&masked, basis)
    }

    /// The datapath stores ICMP type/code in 8 bits while the flow carries
    /// them in the low byte of the 16-bit port fields, so an exact transport
    /// mask must be narrowed to the low byte for ICMP flows or the installed
    /// mask would claim bits the datapath key cannot express.
    pub fn zero_icmp_upper_tp(&mut self, flow: &Flow) {
        if flow.is_icmp_any() {
            self.masks.tp_src &= 0x00ff;
            self.masks.tp_dst &= 0x00ff;
        }
    }
}

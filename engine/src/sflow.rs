// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! sFlow sampling agent.
//!
//! Translation plants SAMPLE/USERSPACE actions; the datapath sends sampled
//! packets back up with an sFlow cookie, and this module turns them into
//! queued sample records for the external exporter.

use std::collections::VecDeque;

use bytes::Bytes;
use datapath::{OdpPort, SFLOW_COOKIE_MULTIPLE_OUTPUTS, UserspaceCookie};

const MAX_RECORDS: usize = 1024;

#[derive(Clone, Debug)]
pub struct SflowConfig {
    /// Sample 1 in N packets. N=1 samples everything.
    pub sampling_n: u32,
    pub collector: String,
    pub agent_device: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SflowSample {
    pub packet: Bytes,
    pub input: OdpPort,
    /// Output port, or `None` when the sampled flow had several outputs.
    pub output: Option<OdpPort>,
    pub n_outputs: u32,
    pub vlan_tci: u16,
}

pub struct SflowAgent {
    pub config: SflowConfig,
    samples: VecDeque<SflowSample>,
    pub n_samples: u64,
    pub n_dropped: u64,
}

impl SflowAgent {
    #[must_use]
    pub fn new(config: SflowConfig) -> SflowAgent {
        SflowAgent {
            config,
            samples: VecDeque::new(),
            n_samples: 0,
            n_dropped: 0,
        }
    }

    /// Datapath sample probability for the configured rate.
    #[must_use]
    pub fn probability(&self) -> u32 {
        match self.config.sampling_n {
            0 | 1 => u32::MAX,
            n => u32::MAX / n,
        }
    }

    /// Handle a sampled-packet upcall.
    pub fn received(&mut self, packet: Bytes, input: OdpPort, cookie: UserspaceCookie) {
        let UserspaceCookie::Sflow { vlan_tci, output } = cookie else {
            return;
        };
        self.n_samples += 1;
        if self.samples.len() >= MAX_RECORDS {
            self.n_dropped += 1;
            self.samples.pop_front();
        }
        let (out_port, n_outputs) = if output & SFLOW_COOKIE_MULTIPLE_OUTPUTS != 0 {
            (None, output & !SFLOW_COOKIE_MULTIPLE_OUTPUTS)
        } else if output == 0 {
            (None, 0)
        } else {
            (Some(OdpPort(output)), 1)
        };
        self.samples.push_back(SflowSample {
            packet,
            input,
            output: out_port,
            n_outputs,
            vlan_tci,
        });
    }

    pub fn take_samples(&mut self) -> Vec<SflowSample> {
        self.samples.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> SflowAgent {
        SflowAgent::new(SflowConfig {
            sampling_n: 1,
            collector: "127.0.0.1:6343".to_string(),
            agent_device: None,
        })
    }

    #[test]
    fn single_output_cookie() {
        let mut a = agent();
        a.received(
            Bytes::from_static(b"pkt"),
            OdpPort(1),
            UserspaceCookie::Sflow {
                vlan_tci: 0,
                output: 7,
            },
        );
        let s = a.take_samples();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].output, Some(OdpPort(7)));
        assert_eq!(s[0].n_outputs, 1);
    }

    #[test]
    fn multiple_output_cookie() {
        let mut a = agent();
        a.received(
            Bytes::from_static(b"pkt"),
            OdpPort(1),
            UserspaceCookie::Sflow {
                vlan_tci: 0,
                output: SFLOW_COOKIE_MULTIPLE_OUTPUTS | 3,
            },
        );
        let s = a.take_samples();
        assert_eq!(s[0].output, None);
        assert_eq!(s[0].n_outputs, 3);
    }

    #[test]
    fn sampling_rate_to_probability() {
        let mut a = agent();
        assert_eq!(a.probability(), u32::MAX);
        a.config.sampling_n = 4;
        assert_eq!(a.probability(), u32::MAX / 4);
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPFIX export: bridge-wide sampling and per-flow Sample-action samples.

use std::collections::VecDeque;

use bytes::Bytes;
use datapath::UserspaceCookie;

const MAX_RECORDS: usize = 1024;

#[derive(Clone, Debug)]
pub struct IpfixConfig {
    /// Bridge-wide sampling: 1 in N. 0 disables the bridge exporter.
    pub bridge_sampling_n: u32,
    pub obs_domain_id: u32,
    pub obs_point_id: u32,
}

#[derive(Clone, Debug)]
pub enum IpfixRecord {
    Bridge {
        packet: Bytes,
    },
    FlowSample {
        packet: Bytes,
        probability: u16,
        collector_set_id: u32,
        obs_domain_id: u32,
        obs_point_id: u32,
    },
}

pub struct IpfixAgent {
    pub config: IpfixConfig,
    records: VecDeque<IpfixRecord>,
    pub n_bridge_samples: u64,
    pub n_flow_samples: u64,
    pub n_dropped: u64,
}

impl IpfixAgent {
    #[must_use]
    pub fn new(config: IpfixConfig) -> IpfixAgent {
        IpfixAgent {
            config,
            records: VecDeque::new(),
            n_bridge_samples: 0,
            n_flow_samples: 0,
            n_dropped: 0,
        }
    }

    #[must_use]
    pub fn bridge_exporter_enabled(&self) -> bool {
        self.config.bridge_sampling_n != 0
    }

    #[must_use]
    pub fn bridge_probability(&self) -> u32 {
        match self.config.bridge_sampling_n {
            0 | 1 => u32::MAX,
            n => u32::MAX / n,
        }
    }

    fn push(&mut self, record: IpfixRecord) {
        if self.records.len() >= MAX_RECORDS {
            self.n_dropped += 1;
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn received(&mut self, packet: Bytes, cookie: UserspaceCookie) {
        match cookie {
            UserspaceCookie::IpfixBridge => {
                self.n_bridge_samples += 1;
                self.push(IpfixRecord::Bridge { packet });
            }
            UserspaceCookie::FlowSample {
                probability,
                collector_set_id,
                obs_domain_id,
                obs_point_id,
            } => {
                self.n_flow_samples += 1;
                self.push(IpfixRecord::FlowSample {
                    packet,
                    probability,
                    collector_set_id,
                    obs_domain_id,
                    obs_point_id,
                });
            }
            _ => {}
        }
    }

    pub fn take_records(&mut self) -> Vec<IpfixRecord> {
        self.records.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_cookies() {
        let mut a = IpfixAgent::new(IpfixConfig {
            bridge_sampling_n: 1,
            obs_domain_id: 1,
            obs_point_id: 1,
        });
        a.received(Bytes::from_static(b"x"), UserspaceCookie::IpfixBridge);
        a.received(
            Bytes::from_static(b"y"),
            UserspaceCookie::FlowSample {
                probability: 100,
                collector_set_id: 5,
                obs_domain_id: 2,
                obs_point_id: 3,
            },
        );
        // Wrong cookie type is ignored.
        a.received(
            Bytes::from_static(b"z"),
            UserspaceCookie::SlowPath { reason: 0 },
        );
        assert_eq!(a.n_bridge_samples, 1);
        assert_eq!(a.n_flow_samples, 1);
        assert_eq!(a.take_records().len(), 2);
    }
}

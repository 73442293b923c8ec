// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;

#[derive(Parser)]
#[command(name = "switchd")]
#[command(version = "0.1.0")]
#[command(about = "Flow-cache OpenFlow switch daemon over an in-memory datapath", long_about = None)]
pub(crate) struct CmdArgs {
    /// Bridge name.
    #[arg(long, value_name = "NAME", default_value = "br0")]
    pub bridge: String,

    /// Ports to create on the bridge.
    #[arg(long, value_name = "NAME")]
    pub port: Vec<String>,

    /// Disable megaflow (masked) installs; every datapath flow exact-match.
    #[arg(long, default_value_t = false)]
    pub disable_megaflows: bool,

    /// Log filter, tracing env-filter syntax.
    #[arg(long, value_name = "FILTER", default_value = "info")]
    pub log: String,

    /// Poll-loop sleep in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 50)]
    pub poll_interval: u64,
}

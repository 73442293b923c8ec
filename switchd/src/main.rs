// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reference daemon: one bridge over the in-memory datapath, a poll loop
//! alternating the slow and fast drivers, and a line-oriented control REPL
//! on stdin (`trace`, `fdb/show`, `dpif/show`, ...).

mod args;

use std::io::BufRead;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::args::{CmdArgs, Parser};
use datapath::DummyDpif;
use engine::{BridgeParamsBuilder, Engine, PortSettings};

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(EnvFilter::new(filter))
        .init();
}

enum Event {
    Line(String),
    Stop,
}

fn main() {
    let args = CmdArgs::parse();
    init_logging(&args.log);
    info!("starting switchd...");

    let (tx, rx) = mpsc::channel();
    let stop_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(Event::Stop);
    })
    .unwrap_or_else(|e| {
        error!("failed to set SIGINT handler: {e}");
        std::process::exit(1);
    });

    // Control commands arrive as stdin lines.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(Event::Line(line)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut engine = Engine::new();
    engine.enable_megaflows = !args.disable_megaflows;

    let dpif = DummyDpif::create("dummy0");
    if let Err(e) = engine.add_backer("dummy", Box::new(dpif)) {
        error!("failed to add backer: {e}");
        std::process::exit(1);
    }
    let params = match BridgeParamsBuilder::default()
        .name(args.bridge.clone())
        .backer("dummy")
        .build()
    {
        Ok(params) => params,
        Err(e) => {
            error!("bad bridge parameters: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = engine.add_bridge(params) {
        error!("failed to add bridge {}: {e}", args.bridge);
        std::process::exit(1);
    }
    for port in &args.port {
        match engine.add_port(&args.bridge, port, PortSettings::default()) {
            Ok(ofp) => info!("added port {port} as {ofp}"),
            Err(e) => error!("failed to add port {port}: {e}"),
        }
    }

    let poll = Duration::from_millis(args.poll_interval);
    info!("bridge {} running; control commands on stdin", args.bridge);
    loop {
        let now = Instant::now();
        engine.run_fast(now);
        engine.run(now);

        match rx.recv_timeout(poll) {
            Ok(Event::Stop) => break,
            Ok(Event::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match engine.handle_ctl(line.trim()) {
                    Ok(output) => print!("{output}{}", if output.ends_with('\n') { "" } else { "\n" }),
                    Err(e) => println!("error: {e}"),
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("shutting down");
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `hubmon`: supervises PCIe switch downstream ports and recovers the hubs
//! behind them when their links misbehave.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use hubmon_core::engine::HotplugEngine;
use hubmon_core::engine::InitError;
use hubmon_core::host::SysfsHost;
use hubmon_core::scan::TARGET_DEVICES;
use hubmon_core::sched;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// PCIe hotplug supervisor for switch downstream ports.
#[derive(Parser)]
#[command(
    name = "hubmon",
    version,
    long_version = long_version(),
    disable_help_subcommand = true
)]
struct Args {
    /// Enable debug logging and dump the device topology at startup.
    #[arg(short, long)]
    verbose: bool,
}

fn long_version() -> String {
    let mut version = concat!(env!("CARGO_PKG_VERSION"), "\nsupported devices:").to_owned();
    for target in TARGET_DEVICES {
        version.push_str(&format!(
            "\n  {:04x}:{:04x} (class {:04x})",
            target.vendor_id, target.device_id, target.class
        ));
    }
    version
}

/// Exit code when no supported devices are present at startup.
const EXIT_NO_DEVICES: u8 = libc::ENODEV as u8;

/// Exit code when the run completed but some devices were unreadable.
const EXIT_READ_ERRORS: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, shutdown.clone())
            .context("failed to register shutdown signal handler")?;
    }

    let mut engine = HotplugEngine::new(SysfsHost::new(), args.verbose);
    match engine.initialize() {
        Ok(()) => {}
        Err(InitError::NoTargetDevices) => {
            tracing::error!("no supported switch or hub devices on the bus");
            return Ok(ExitCode::from(EXIT_NO_DEVICES));
        }
        Err(err) => return Err(err).context("startup failed"),
    }

    sched::run(&mut engine, &shutdown).context("monitoring cycle failed")?;

    if engine.read_errors() > 0 {
        tracing::warn!(
            read_errors = engine.read_errors(),
            "exiting after unreadable devices were skipped"
        );
        return Ok(ExitCode::from(EXIT_READ_ERRORS));
    }
    Ok(ExitCode::SUCCESS)
}

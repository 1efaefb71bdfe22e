// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The monitoring loop: a fixed-period scheduler driving the engine on one
//! thread.

use crate::engine::HotplugEngine;
use crate::host::HostError;
use crate::host::HostPci;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// Delay before the first monitoring cycle, giving the bus time to settle
/// after the startup scan.
pub const INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Nominal period between monitoring cycles.
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Upper bound on one sleep, so a shutdown request is noticed promptly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Runs monitoring cycles until `shutdown` is set or a cycle fails.
///
/// Cycles are scheduled against absolute deadlines. When a cycle overruns
/// its deadline the missed cycles are dropped rather than run back to back.
pub fn run<H: HostPci>(
    engine: &mut HotplugEngine<H>,
    shutdown: &AtomicBool,
) -> Result<(), HostError> {
    let mut next = Instant::now() + INITIAL_DELAY;
    loop {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested, stopping monitor loop");
                return Ok(());
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            std::thread::sleep((next - now).min(SHUTDOWN_POLL));
        }

        engine.tick()?;

        next += TICK_PERIOD;
        let now = Instant::now();
        if next < now {
            tracing::debug!("cycle overran its deadline, dropping missed cycles");
            next = now + TICK_PERIOD;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::standard_tree;

    #[test]
    fn shutdown_before_the_first_cycle_runs_no_cycle() {
        let mut engine = HotplugEngine::new(standard_tree(), false);
        engine.initialize().unwrap();
        let reads = engine.host().config_reads();

        let shutdown = AtomicBool::new(true);
        run(&mut engine, &shutdown).unwrap();
        assert_eq!(engine.host().config_reads(), reads);
    }

    #[test]
    fn cycles_run_until_shutdown_is_requested() {
        let mut engine = HotplugEngine::new(standard_tree(), false);
        engine.initialize().unwrap();
        let reads = engine.host().config_reads();

        let shutdown = AtomicBool::new(false);
        std::thread::scope(|s| {
            let handle = s.spawn(|| run(&mut engine, &shutdown));
            std::thread::sleep(INITIAL_DELAY + 4 * TICK_PERIOD);
            shutdown.store(true, Ordering::Relaxed);
            handle.join().unwrap().unwrap();
        });
        assert!(
            engine.host().config_reads() > reads,
            "at least one cycle must have scanned the bus"
        );
    }
}

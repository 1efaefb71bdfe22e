// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hotplug engine: one scan per cycle, then per-port recovery decisions
//! from the (link, hub) state pair.
//!
//! Recovery escalates in three steps. A live link with a missing hub gets a
//! bus rescan. A dead link with a stale hub gets the port removed and the
//! bus rescanned. A dead link with no hub is debounced for a full second of
//! cycles, then the port is power cycled through the switch's disable
//! register.

use crate::diag;
use crate::host::HostError;
use crate::host::HostPci;
use crate::link;
use crate::link::LinkQuality;
use crate::registry;
use crate::registry::Registry;
use crate::scan;
use pci_sysfs::Bdf;
use pcie_spec::switch;
use thiserror::Error;

/// Consecutive down cycles before a power cycle. At the nominal cycle
/// period this is one second of continuous outage.
pub const DEBOUNCE_THRESHOLD: u32 = 10;

/// Startup failure.
#[derive(Debug, Error)]
pub enum InitError {
    /// The initial bus scan failed.
    #[error("initial bus scan failed")]
    Scan(#[source] HostError),
    /// No supported switch or hub silicon is present.
    #[error("no supported devices found on the bus")]
    NoTargetDevices,
}

/// The supervisor's monitoring engine.
///
/// Owns the host handle and the port registry; [`Self::tick`] takes `&mut
/// self`, so at most one cycle can ever be in flight.
#[derive(Debug)]
pub struct HotplugEngine<H> {
    host: H,
    registry: Registry,
    read_errors: u64,
    nonzero_domain_seen: bool,
    verbose: bool,
}

impl<H: HostPci> HotplugEngine<H> {
    /// Creates an engine over `host`. `verbose` enables the startup
    /// topology dump.
    pub fn new(host: H, verbose: bool) -> Self {
        Self {
            host,
            registry: Registry::default(),
            read_errors: 0,
            nonzero_domain_seen: false,
            verbose,
        }
    }

    /// The host handle.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The watched ports.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The watched ports, mutably.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Total functions dropped across all scans because their configuration
    /// space was unreadable.
    pub fn read_errors(&self) -> u64 {
        self.read_errors
    }

    /// Scans the bus and populates the port registry.
    ///
    /// Ports whose hub is present but asleep are excluded from power
    /// cycling for the life of the process.
    pub fn initialize(&mut self) -> Result<(), InitError> {
        let snapshot = scan::scan_bus(&self.host).map_err(InitError::Scan)?;
        self.read_errors += u64::from(snapshot.read_errors);
        self.nonzero_domain_seen |= snapshot.nonzero_domain_seen;
        if snapshot.topology.devices().is_empty() {
            return Err(InitError::NoTargetDevices);
        }

        self.registry = Registry::populate(&snapshot.topology);
        for device_number in registry::asleep_ports(&snapshot.topology, &self.registry) {
            tracing::warn!(
                device_number,
                "hub asleep at startup, port excluded from power cycling"
            );
            self.registry.mark_no_hotplug(device_number);
        }

        if self.verbose {
            for dev in snapshot.topology.devices() {
                tracing::info!(
                    "{}",
                    diag::render_device(&snapshot.topology, dev, self.nonzero_domain_seen)
                );
            }
        }
        Ok(())
    }

    /// Runs one monitoring cycle.
    pub fn tick(&mut self) -> Result<(), HostError> {
        let snapshot = scan::scan_bus(&self.host)?;
        self.read_errors += u64::from(snapshot.read_errors);
        self.nonzero_domain_seen |= snapshot.nonzero_domain_seen;

        let topology = &snapshot.topology;
        let host = &self.host;
        let verbose = self.verbose;
        let show_domains = self.nonzero_domain_seen;
        for entry in self.registry.entries_mut() {
            if entry.no_hotplug {
                tracing::debug!(port = %entry.own, "port excluded, skipping");
                continue;
            }
            let Some(port) = Registry::find_match(topology, &entry.own) else {
                tracing::debug!(port = %entry.own, "port not present this cycle");
                continue;
            };

            let link_up = link::data_link_active(port);
            let hub_up = link::hub_alive(topology, port);
            if let Some(quality) = link::link_quality(port) {
                if quality != LinkQuality::Ideal {
                    tracing::debug!(
                        port = %entry.own,
                        ?quality,
                        "link negotiated below capability"
                    );
                }
            }

            match (link_up, hub_up) {
                (true, true) => {
                    tracing::trace!(port = %entry.own, "link and hub nominal");
                }
                (true, false) => {
                    tracing::info!(
                        port = %entry.own,
                        "link up but hub not enumerated, rescanning"
                    );
                    host.rescan_bus()?;
                    host.settle();
                    if verbose {
                        tracing::info!("{}", diag::render_device(topology, port, show_domains));
                    }
                }
                (false, true) => {
                    tracing::info!(
                        port = %entry.own,
                        "link down with hub still enumerated, removing stale port"
                    );
                    host.remove_function(entry.own.bdf)?;
                    host.rescan_bus()?;
                    host.settle();
                }
                (false, false) => {
                    entry.link_down_count += 1;
                    entry.hub_down_count += 1;
                    if entry.link_down_count >= DEBOUNCE_THRESHOLD
                        || entry.hub_down_count >= DEBOUNCE_THRESHOLD
                    {
                        entry.link_down_count = 0;
                        entry.hub_down_count = 0;
                        let parent = entry
                            .parent
                            .as_ref()
                            .and_then(|filter| Registry::find_match(topology, filter));
                        let Some(parent) = parent else {
                            tracing::warn!(
                                port = %entry.own,
                                "port down with no parent bridge, cannot power cycle"
                            );
                            continue;
                        };
                        tracing::info!(
                            port = %entry.own,
                            parent = %parent.bdf,
                            "port down for a full second, power cycling"
                        );
                        power_cycle(host, parent.bdf)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pulses the disable bit of the switch's port control register.
fn power_cycle<H: HostPci + ?Sized>(host: &H, parent: Bdf) -> Result<(), HostError> {
    let value = host.read_register(parent, switch::PORT_DISABLE)?;
    host.write_register(parent, switch::PORT_DISABLE, value | switch::PORT_DISABLE_BIT)?;
    // Hold the port down briefly so the far end sees a clean transition.
    for _ in 0..100 {
        std::hint::spin_loop();
    }
    let value = host.read_register(parent, switch::PORT_DISABLE)?;
    host.write_register(parent, switch::PORT_DISABLE, value & !switch::PORT_DISABLE_BIT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::port_config;
    use crate::fake::standard_tree;
    use crate::fake::Action;
    use crate::fake::FakeHost;
    use crate::fake::HUB;
    use crate::fake::PORT;
    use crate::fake::UPSTREAM;

    fn running_engine() -> HotplugEngine<FakeHost> {
        let mut engine = HotplugEngine::new(standard_tree(), false);
        engine.initialize().unwrap();
        engine.host().take_actions();
        engine
    }

    #[test]
    fn initialize_populates_the_registry() {
        let engine = running_engine();
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.registry().entries()[0].own.bdf, PORT);
    }

    #[test]
    fn initialize_without_targets_reports_nothing_to_do() {
        let host = FakeHost::new();
        let mut engine = HotplugEngine::new(host, false);
        assert!(matches!(
            engine.initialize(),
            Err(InitError::NoTargetDevices)
        ));
    }

    #[test]
    fn initialize_excludes_asleep_hub_from_power_cycling() {
        use pcie_spec::caps::power_management::PowerState;

        let host = FakeHost::new();
        crate::fake::build_standard_tree(&host, |hub| hub.power_state(PowerState::D3Hot));
        let mut engine = HotplugEngine::new(host, false);
        engine.initialize().unwrap();
        assert!(engine.registry().entries()[0].no_hotplug);
    }

    #[test]
    fn nominal_cycle_takes_no_action() {
        let mut engine = running_engine();
        engine.tick().unwrap();
        assert_eq!(engine.host().take_actions(), vec![]);
        assert_eq!(engine.registry().entries()[0].link_down_count, 0);
    }

    #[test]
    fn missing_hub_with_live_link_triggers_rescan() {
        let mut engine = running_engine();
        engine.host().detach(HUB);

        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions(),
            vec![Action::Rescan, Action::Settle]
        );
    }

    #[test]
    fn dead_link_with_stale_hub_removes_the_port() {
        let mut engine = running_engine();
        engine.host().set_function_config(PORT, port_config(false));

        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions(),
            vec![Action::Remove(PORT), Action::Rescan, Action::Settle]
        );
    }

    fn take_port_down(engine: &HotplugEngine<FakeHost>) {
        engine.host().set_function_config(PORT, port_config(false));
        engine.host().detach(HUB);
    }

    #[test]
    fn full_outage_power_cycles_after_ten_cycles() {
        let mut engine = running_engine();
        take_port_down(&engine);

        for _ in 0..9 {
            engine.tick().unwrap();
        }
        assert_eq!(
            engine.host().take_actions(),
            vec![],
            "nine down cycles must not act yet"
        );
        assert_eq!(engine.registry().entries()[0].link_down_count, 9);

        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions(),
            vec![
                Action::RegRead(UPSTREAM, switch::PORT_DISABLE),
                Action::RegWrite(UPSTREAM, switch::PORT_DISABLE, 1),
                Action::RegRead(UPSTREAM, switch::PORT_DISABLE),
                Action::RegWrite(UPSTREAM, switch::PORT_DISABLE, 0),
            ]
        );
        assert_eq!(
            engine.registry().entries()[0].link_down_count,
            0,
            "counters must reset after the power cycle"
        );
        assert_eq!(engine.host().register(UPSTREAM, switch::PORT_DISABLE), 0);

        // The next cycle needs a fresh ten before it fires again.
        for _ in 0..9 {
            engine.tick().unwrap();
        }
        assert_eq!(engine.host().take_actions(), vec![]);
        engine.tick().unwrap();
        assert_eq!(engine.host().take_actions().len(), 4);
    }

    #[test]
    fn up_cycle_does_not_clear_down_counters() {
        let mut engine = running_engine();
        take_port_down(&engine);
        for _ in 0..5 {
            engine.tick().unwrap();
        }

        engine.host().set_function_config(PORT, port_config(true));
        engine.host().attach(HUB);
        engine.tick().unwrap();
        assert_eq!(engine.registry().entries()[0].link_down_count, 5);

        take_port_down(&engine);
        for _ in 0..4 {
            engine.tick().unwrap();
        }
        assert_eq!(engine.host().take_actions(), vec![]);
        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions().len(),
            4,
            "the tenth cumulative down cycle must power cycle"
        );
    }

    #[test]
    fn excluded_port_is_never_acted_on() {
        let mut engine = running_engine();
        let number = engine.registry().entries()[0].device_number;
        assert!(engine.registry_mut().mark_no_hotplug(number));
        take_port_down(&engine);

        for _ in 0..20 {
            engine.tick().unwrap();
        }
        assert_eq!(engine.host().take_actions(), vec![]);
    }

    #[test]
    fn unmatched_port_is_left_alone() {
        let mut engine = running_engine();
        // A different card now answers at the port's address.
        engine.host().set_function_config(
            PORT,
            crate::fake::ConfigBuilder::bridge(0x10b5, 0x9999).build(),
        );

        for _ in 0..20 {
            engine.tick().unwrap();
        }
        assert_eq!(engine.host().take_actions(), vec![]);
        assert_eq!(engine.registry().entries()[0].link_down_count, 0);
    }

    #[test]
    fn unplug_then_replug_recovers() {
        let mut engine = running_engine();
        engine.tick().unwrap();
        assert_eq!(engine.host().take_actions(), vec![]);

        // The link drops but the kernel still shows the hub.
        engine.host().set_function_config(PORT, port_config(false));
        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions(),
            vec![Action::Remove(PORT), Action::Rescan, Action::Settle]
        );

        // The link comes back before the hub re-enumerates.
        engine.host().set_function_config(PORT, port_config(true));
        engine.host().detach(HUB);
        engine.tick().unwrap();
        assert_eq!(
            engine.host().take_actions(),
            vec![Action::Rescan, Action::Settle]
        );
        assert_eq!(engine.registry().entries()[0].link_down_count, 0);
        assert_eq!(engine.registry().entries()[0].hub_down_count, 0);
    }
}

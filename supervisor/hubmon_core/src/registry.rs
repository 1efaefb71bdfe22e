// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The port registry: the set of downstream switch ports the supervisor
//! watches, remembered by identity rather than by topology index.
//!
//! Indices into a [`Topology`] die with the snapshot, so each registry
//! entry stores value-typed identity filters and re-resolves them against
//! the fresh snapshot every cycle.

use crate::link;
use crate::topology::Device;
use crate::topology::Topology;
use pci_sysfs::Bdf;
use std::fmt;

/// Identity of one function: address plus the header triple.
///
/// A device matches only if all four fields match, so a different card
/// enumerated at the same address after a rescan is not mistaken for the
/// original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityFilter {
    /// The function's address.
    pub bdf: Bdf,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class and subclass word.
    pub class: u16,
}

impl IdentityFilter {
    /// Captures the identity of `dev`.
    pub fn of(dev: &Device) -> Self {
        Self {
            bdf: dev.bdf,
            vendor_id: dev.vendor_id,
            device_id: dev.device_id,
            class: dev.class,
        }
    }

    /// Whether `dev` has this identity.
    pub fn matches(&self, dev: &Device) -> bool {
        self.bdf == dev.bdf
            && self.vendor_id == dev.vendor_id
            && self.device_id == dev.device_id
            && self.class == dev.class
    }
}

impl fmt::Display for IdentityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}]",
            self.bdf, self.vendor_id, self.device_id
        )
    }
}

/// One watched downstream port.
#[derive(Debug)]
pub struct RegistryEntry {
    /// The port's downstream number, stable for the life of the process.
    pub device_number: u32,
    /// The port itself.
    pub own: IdentityFilter,
    /// The bridge upstream of the port, where the port disable register
    /// lives.
    pub parent: Option<IdentityFilter>,
    /// The hub expected behind the port.
    pub hub: Option<IdentityFilter>,
    /// Set when the port must never be power cycled, for example because
    /// its hub was found asleep at startup.
    pub no_hotplug: bool,
    /// Consecutive cycles the link has been down.
    pub link_down_count: u32,
    /// Consecutive cycles the hub has been unresponsive.
    pub hub_down_count: u32,
    /// Reserved for debouncing degraded-link observations; no recovery
    /// action drives it yet.
    pub link_bad_count: u32,
}

/// The set of watched ports, populated once at startup.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Builds the registry from the initial topology snapshot, one entry
    /// per downstream switch port.
    pub fn populate(topology: &Topology) -> Self {
        let mut entries = Vec::new();
        for dev in topology.devices() {
            if dev.downstream_number == 0 {
                continue;
            }
            let entry = RegistryEntry {
                device_number: dev.downstream_number,
                own: IdentityFilter::of(dev),
                parent: topology.parent_bridge(dev).map(IdentityFilter::of),
                hub: topology.first_child(dev).map(IdentityFilter::of),
                no_hotplug: false,
                link_down_count: 0,
                hub_down_count: 0,
                link_bad_count: 0,
            };
            tracing::info!(
                port = %entry.own,
                device_number = entry.device_number,
                hub = entry.hub.as_ref().map(tracing::field::display),
                "watching downstream port"
            );
            entries.push(entry);
        }
        Self { entries }
    }

    /// Number of watched ports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no ports are watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The watched ports.
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// The watched ports, mutably.
    pub fn entries_mut(&mut self) -> &mut [RegistryEntry] {
        &mut self.entries
    }

    /// Excludes the port numbered `device_number` from power cycling.
    ///
    /// Returns `false` if no such port is watched.
    pub fn mark_no_hotplug(&mut self, device_number: u32) -> bool {
        for entry in &mut self.entries {
            if entry.device_number == device_number {
                entry.no_hotplug = true;
                return true;
            }
        }
        false
    }

    /// Resolves `filter` against a topology snapshot.
    pub fn find_match<'a>(topology: &'a Topology, filter: &IdentityFilter) -> Option<&'a Device> {
        topology.devices().iter().find(|dev| filter.matches(dev))
    }
}

/// Ports whose hub is present but not in D0 at startup. These are left
/// alone for the life of the process.
pub fn asleep_ports(topology: &Topology, registry: &Registry) -> Vec<u32> {
    use pcie_spec::caps::power_management::PowerState;

    let mut asleep = Vec::new();
    for entry in registry.entries() {
        let Some(hub) = entry.hub.as_ref() else {
            continue;
        };
        let Some(dev) = Registry::find_match(topology, hub) else {
            continue;
        };
        if link::power_state(dev).is_some_and(|state| state != PowerState::D0) {
            asleep.push(entry.device_number);
        }
    }
    asleep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::standard_tree;
    use crate::fake::FakeHost;
    use crate::fake::HUB;
    use crate::fake::PORT;
    use crate::fake::UPSTREAM;
    use crate::scan;
    use pcie_spec::caps::power_management::PowerState;

    #[test]
    fn populate_captures_parent_and_hub_identities() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let registry = Registry::populate(&snapshot.topology);

        assert_eq!(registry.len(), 1);
        let entry = &registry.entries()[0];
        assert_eq!(entry.device_number, 1);
        assert_eq!(entry.own.bdf, PORT);
        assert_eq!(entry.parent.unwrap().bdf, UPSTREAM);
        let hub = entry.hub.unwrap();
        assert_eq!(hub.bdf, HUB);
        assert_eq!(hub.vendor_id, 0x104c);
        assert_eq!(entry.link_down_count, 0);
        assert!(!entry.no_hotplug);
    }

    #[test]
    fn filters_survive_a_topology_rebuild() {
        let host = standard_tree();
        let first = scan::scan_bus(&host).unwrap();
        let registry = Registry::populate(&first.topology);
        let entry = &registry.entries()[0];

        let second = scan::scan_bus(&host).unwrap();
        let port = Registry::find_match(&second.topology, &entry.own).expect("port matches");
        assert_eq!(port.bdf, PORT);
    }

    #[test]
    fn identity_mismatch_does_not_match() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let registry = Registry::populate(&snapshot.topology);

        let mut filter = registry.entries()[0].own;
        filter.device_id = 0x9999;
        assert!(Registry::find_match(&snapshot.topology, &filter).is_none());
    }

    #[test]
    fn mark_no_hotplug_by_device_number() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let mut registry = Registry::populate(&snapshot.topology);

        assert!(registry.mark_no_hotplug(1));
        assert!(registry.entries()[0].no_hotplug);
        assert!(!registry.mark_no_hotplug(7));
    }

    #[test]
    fn hub_asleep_at_startup_is_reported() {
        let host = FakeHost::new();
        crate::fake::build_standard_tree(&host, |hub| hub.power_state(PowerState::D3Hot));
        let snapshot = scan::scan_bus(&host).unwrap();
        let registry = Registry::populate(&snapshot.topology);

        assert_eq!(asleep_ports(&snapshot.topology, &registry), vec![1]);
    }

    #[test]
    fn hub_awake_at_startup_is_not_reported() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let registry = Registry::populate(&snapshot.topology);

        assert!(asleep_ports(&snapshot.topology, &registry).is_empty());
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The scanned bus hierarchy: devices, the buses they sit on, and the
//! bridge links between buses.
//!
//! A [`Topology`] is an immutable snapshot. Each monitoring cycle builds a
//! fresh one from a fresh scan, so indices are only meaningful within one
//! snapshot and are never stored across cycles.

use crate::cache::ConfigCache;
use pci_sysfs::Bdf;
use pcie_spec::cfg_space;

/// One scanned PCI function and its cached configuration space.
#[derive(Debug)]
pub struct Device {
    /// The function's address.
    pub bdf: Bdf,
    /// Vendor ID from the header.
    pub vendor_id: u16,
    /// Device ID from the header.
    pub device_id: u16,
    /// Class and subclass code, as in the header's upper class word.
    pub class: u16,
    /// Raw header type byte, multifunction bit included.
    pub header_type: u8,
    /// Position in the scan-ordered list of downstream switch ports,
    /// starting at 1. Zero for every other device.
    pub downstream_number: u32,
    /// Cached configuration space.
    pub config: ConfigCache,
    pub(crate) upstream_bus: Option<usize>,
    pub(crate) secondary_bus: Option<usize>,
}

impl Device {
    /// Creates a device from an eagerly fetched configuration cache.
    pub fn new(bdf: Bdf, config: ConfigCache) -> Self {
        Self {
            bdf,
            vendor_id: config.get_word(cfg_space::offset::VENDOR_ID),
            device_id: config.get_word(cfg_space::offset::DEVICE_ID),
            class: config.get_word(cfg_space::offset::CLASS_DEVICE),
            header_type: config.get_byte(cfg_space::offset::HEADER_TYPE),
            downstream_number: 0,
            config,
            upstream_bus: None,
            secondary_bus: None,
        }
    }

    /// Whether the header describes a PCI-to-PCI bridge.
    pub fn is_bridge(&self) -> bool {
        self.header_type & cfg_space::HEADER_TYPE_MASK == cfg_space::HEADER_TYPE_BRIDGE
    }
}

#[derive(Debug)]
struct BusNode {
    domain: u16,
    number: u8,
    parent_bridge: Option<usize>,
    devices: Vec<usize>,
}

/// An immutable snapshot of the scanned bus hierarchy.
#[derive(Debug)]
pub struct Topology {
    devices: Vec<Device>,
    buses: Vec<BusNode>,
}

impl Topology {
    /// Builds the hierarchy from scan-ordered devices.
    ///
    /// `devices` must already be sorted by address; the builder preserves
    /// that order.
    pub fn build(mut devices: Vec<Device>) -> Self {
        let mut buses: Vec<BusNode> = Vec::new();
        let bus_index = |buses: &mut Vec<BusNode>, domain: u16, number: u8| -> usize {
            if let Some(idx) = buses
                .iter()
                .position(|b| b.domain == domain && b.number == number)
            {
                idx
            } else {
                buses.push(BusNode {
                    domain,
                    number,
                    parent_bridge: None,
                    devices: Vec::new(),
                });
                buses.len() - 1
            }
        };

        for (dev_idx, dev) in devices.iter_mut().enumerate() {
            let upstream = bus_index(&mut buses, dev.bdf.domain, dev.bdf.bus);
            dev.upstream_bus = Some(upstream);
            buses[upstream].devices.push(dev_idx);

            if dev.is_bridge() {
                let secondary = dev.config.get_byte(cfg_space::offset::SECONDARY_BUS);
                // Secondary bus 0 means the bridge is unconfigured.
                if secondary != 0 {
                    let idx = bus_index(&mut buses, dev.bdf.domain, secondary);
                    buses[idx].parent_bridge = Some(dev_idx);
                    dev.secondary_bus = Some(idx);
                }
            }
        }

        Self { devices, buses }
    }

    /// All devices, in scan order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The bridge fronting the bus `dev` sits on, if any.
    pub fn parent_bridge(&self, dev: &Device) -> Option<&Device> {
        let bus = dev.upstream_bus?;
        let bridge = self.buses[bus].parent_bridge?;
        Some(&self.devices[bridge])
    }

    /// The lowest-addressed device behind bridge `dev`, if any.
    pub fn first_child(&self, dev: &Device) -> Option<&Device> {
        let bus = dev.secondary_bus?;
        let child = *self.buses[bus].devices.first()?;
        Some(&self.devices[child])
    }

    /// How many devices are directly behind bridge `dev`.
    pub fn child_count(&self, dev: &Device) -> usize {
        dev.secondary_bus
            .map_or(0, |bus| self.buses[bus].devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ConfigBuilder;
    use crate::fake::FakeHost;

    fn device(host: &FakeHost, bdf: Bdf, builder: ConfigBuilder) -> Device {
        host.add_function(bdf, builder.build());
        let mut config = ConfigCache::new();
        assert!(config.fetch(host, bdf, 0, 256));
        Device::new(bdf, config)
    }

    fn three_level_tree() -> Topology {
        let host = FakeHost::new();
        let bridge = device(
            &host,
            Bdf::new(0, 1, 0, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).secondary_bus(2),
        );
        let port = device(
            &host,
            Bdf::new(0, 2, 1, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).secondary_bus(3),
        );
        let hub = device(
            &host,
            Bdf::new(0, 3, 0, 0),
            ConfigBuilder::endpoint(0x104c, 0x8241),
        );
        Topology::build(vec![bridge, port, hub])
    }

    #[test]
    fn header_fields_are_decoded() {
        let host = FakeHost::new();
        let dev = device(
            &host,
            Bdf::new(0, 3, 0, 0),
            ConfigBuilder::endpoint(0x104c, 0x8241),
        );
        assert_eq!(dev.vendor_id, 0x104c);
        assert_eq!(dev.device_id, 0x8241);
        assert_eq!(dev.class, cfg_space::class::SERIAL_USB);
        assert!(!dev.is_bridge());
    }

    #[test]
    fn parent_bridge_follows_the_upstream_bus() {
        let topology = three_level_tree();
        let hub = &topology.devices()[2];
        let parent = topology.parent_bridge(hub).expect("hub has a parent");
        assert_eq!(parent.bdf, Bdf::new(0, 2, 1, 0));

        let root = &topology.devices()[0];
        assert!(topology.parent_bridge(root).is_none());
    }

    #[test]
    fn first_child_is_lowest_addressed() {
        let host = FakeHost::new();
        let port = device(
            &host,
            Bdf::new(0, 2, 1, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).secondary_bus(3),
        );
        let late = device(
            &host,
            Bdf::new(0, 3, 0, 1),
            ConfigBuilder::endpoint(0x104c, 0x8241),
        );
        let early = device(
            &host,
            Bdf::new(0, 3, 0, 0),
            ConfigBuilder::endpoint(0x104c, 0x8241),
        );
        // Scan order puts function 0 first.
        let topology = Topology::build(vec![port, early, late]);
        let port = &topology.devices()[0];
        assert_eq!(
            topology.first_child(port).unwrap().bdf,
            Bdf::new(0, 3, 0, 0)
        );
        assert_eq!(topology.child_count(port), 2);
    }

    #[test]
    fn bridge_with_no_children_counts_zero() {
        let host = FakeHost::new();
        let port = device(
            &host,
            Bdf::new(0, 2, 1, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).secondary_bus(3),
        );
        let topology = Topology::build(vec![port]);
        let port = &topology.devices()[0];
        assert!(topology.first_child(port).is_none());
        assert_eq!(topology.child_count(port), 0);
    }

    #[test]
    fn unconfigured_bridge_has_no_secondary_bus() {
        let host = FakeHost::new();
        let bridge = device(
            &host,
            Bdf::new(0, 1, 0, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608),
        );
        let topology = Topology::build(vec![bridge]);
        assert!(topology.first_child(&topology.devices()[0]).is_none());
    }

    #[test]
    fn same_bus_number_in_different_domains_is_distinct() {
        let host = FakeHost::new();
        let a = device(
            &host,
            Bdf::new(0, 1, 0, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).secondary_bus(2),
        );
        let b = device(
            &host,
            Bdf::new(1, 2, 0, 0),
            ConfigBuilder::endpoint(0x104c, 0x8241),
        );
        let topology = Topology::build(vec![a, b]);
        let bridge = &topology.devices()[0];
        assert_eq!(
            topology.child_count(bridge),
            0,
            "domain 1 bus 2 must not attach under a domain 0 bridge"
        );
    }
}

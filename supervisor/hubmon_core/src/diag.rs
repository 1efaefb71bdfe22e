// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Human-readable device summaries for the startup topology dump.

use crate::link;
use crate::topology::Device;
use crate::topology::Topology;
use pcie_spec::caps;
use pcie_spec::caps::pci_express;
use pcie_spec::caps::pci_express::link_speed_name;
use pcie_spec::caps::pci_express::DevicePortType;
use pcie_spec::caps::pci_express::LinkCapabilities;
use pcie_spec::caps::pci_express::LinkStatus;
use pcie_spec::caps::pci_express::PciExpressFlags;
use pcie_spec::caps::pci_express::SlotStatus;
use std::fmt::Write;

fn port_type_name(port_type: DevicePortType) -> &'static str {
    match port_type {
        DevicePortType::Endpoint => "endpoint",
        DevicePortType::LegacyEndpoint => "legacy endpoint",
        DevicePortType::RootPort => "root port",
        DevicePortType::UpstreamSwitchPort => "upstream switch port",
        DevicePortType::DownstreamSwitchPort => "downstream switch port",
        DevicePortType::PcieToPciBridge => "pcie-to-pci bridge",
        DevicePortType::PciToPcieBridge => "pci-to-pcie bridge",
        DevicePortType::RootComplexIntegratedEndpoint => "root complex endpoint",
        DevicePortType::RootComplexEventCollector => "root complex event collector",
        DevicePortType::Reserved => "reserved port type",
    }
}

fn format_bdf(dev: &Device, show_domains: bool) -> String {
    if show_domains {
        dev.bdf.to_string()
    } else {
        format!(
            "{:02x}:{:02x}.{:x}",
            dev.bdf.bus, dev.bdf.device, dev.bdf.function
        )
    }
}

/// Renders a one-line summary of `dev`: identity, port type, link state,
/// slot, power state, and child count.
pub fn render_device(topology: &Topology, dev: &Device, show_domains: bool) -> String {
    let mut out = format!(
        "{} [{:04x}:{:04x}]",
        format_bdf(dev, show_domains),
        dev.vendor_id,
        dev.device_id
    );

    if let Some(port_type) = link::device_type(dev) {
        let _ = write!(out, " {}", port_type_name(port_type));
        if dev.downstream_number != 0 {
            let _ = write!(out, " (port {})", dev.downstream_number);
        }
    }

    if let Some(cap) = link::find_capability(dev, caps::ids::PCI_EXPRESS) {
        let link_caps =
            LinkCapabilities::from(dev.config.get_long(cap + pci_express::offset::LINK_CAPS));
        let status = LinkStatus::from(dev.config.get_word(cap + pci_express::offset::LINK_STATUS));
        let _ = write!(
            out,
            ", link {} x{} (capable {} x{}), {}",
            link_speed_name(status.current_link_speed()),
            status.negotiated_link_width(),
            link_speed_name(link_caps.max_link_speed() as u16),
            link_caps.max_link_width(),
            if status.data_link_layer_link_active() {
                "link up"
            } else {
                "link down"
            }
        );

        let flags =
            PciExpressFlags::from(dev.config.get_word(cap + pci_express::offset::PCIE_FLAGS));
        if flags.slot_implemented() {
            let slot =
                SlotStatus::from(dev.config.get_word(cap + pci_express::offset::SLOT_STATUS));
            out.push_str(if slot.presence_detect_state() {
                ", slot occupied"
            } else {
                ", slot empty"
            });
        }
    }

    if let Some(state) = link::power_state(dev) {
        let _ = write!(out, ", power {state:?}");
    }

    if dev.is_bridge() {
        let children = topology.child_count(dev);
        let _ = write!(
            out,
            ", {} {}",
            children,
            if children == 1 { "child" } else { "children" }
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::standard_tree;
    use crate::fake::ConfigBuilder;
    use crate::fake::FakeHost;
    use crate::scan;
    use pci_sysfs::Bdf;

    #[test]
    fn downstream_port_line_names_link_and_children() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let port = snapshot
            .topology
            .devices()
            .iter()
            .find(|d| d.downstream_number == 1)
            .unwrap();

        let line = render_device(&snapshot.topology, port, false);
        assert!(line.starts_with("02:01.0 [10b5:8608]"), "{line}");
        assert!(line.contains("downstream switch port (port 1)"), "{line}");
        assert!(line.contains("link 8GT/s x4 (capable 8GT/s x4)"), "{line}");
        assert!(line.contains("link up"), "{line}");
        assert!(line.contains("1 child"), "{line}");
    }

    #[test]
    fn domains_are_shown_only_on_request() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let hub = snapshot.topology.devices().last().unwrap();

        let short = render_device(&snapshot.topology, hub, false);
        assert!(short.starts_with("03:00.0"), "{short}");
        let full = render_device(&snapshot.topology, hub, true);
        assert!(full.starts_with("0000:03:00.0"), "{full}");
    }

    #[test]
    fn hub_line_names_power_state() {
        let host = standard_tree();
        let snapshot = scan::scan_bus(&host).unwrap();
        let hub = snapshot.topology.devices().last().unwrap();

        let line = render_device(&snapshot.topology, hub, false);
        assert!(line.contains("endpoint"), "{line}");
        assert!(line.contains("power D0"), "{line}");
    }

    #[test]
    fn implemented_slot_reports_presence() {
        let host = FakeHost::new();
        host.add_function(
            Bdf::new(0, 2, 1, 0),
            ConfigBuilder::bridge(0x10b5, 0x8608).slot(true).build(),
        );
        let snapshot = scan::scan_bus(&host).unwrap();
        let port = &snapshot.topology.devices()[0];

        let line = render_device(&snapshot.topology, port, false);
        assert!(line.contains("slot occupied"), "{line}");
    }

    #[test]
    fn device_without_capabilities_renders_identity_only() {
        let host = FakeHost::new();
        host.add_function(
            Bdf::new(0, 3, 0, 0),
            ConfigBuilder::endpoint(0x104c, 0x8241)
                .without_capabilities()
                .build(),
        );
        let snapshot = scan::scan_bus(&host).unwrap();
        let dev = &snapshot.topology.devices()[0];

        let line = render_device(&snapshot.topology, dev, false);
        assert_eq!(line, "03:00.0 [104c:8241]");
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interpretation of the express capability registers: port type, data link
//! state, power state, and link quality.
//!
//! All queries run against a device's cached configuration space; nothing
//! here touches the host.

use crate::topology::Device;
use crate::topology::Topology;
use pcie_spec::caps;
use pcie_spec::caps::pci_express;
use pcie_spec::caps::pci_express::DevicePortType;
use pcie_spec::caps::pci_express::LinkCapabilities;
use pcie_spec::caps::pci_express::LinkStatus;
use pcie_spec::caps::pci_express::PciExpressFlags;
use pcie_spec::caps::power_management;
use pcie_spec::caps::power_management::PowerState;
use pcie_spec::cfg_space;

/// The negotiated link, compared against what the hardware can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    /// Negotiated speed and width both meet the capable values.
    Ideal,
    /// Negotiated speed is below the capable speed.
    SpeedDegraded,
    /// Negotiated width is below the capable width.
    WidthDegraded,
    /// Both speed and width are below their capable values.
    BothDegraded,
}

/// Longest capability chain the walk will follow before assuming a loop.
const MAX_CAP_CHAIN: usize = 48;

/// Finds the configuration space offset of capability `id`, walking the
/// standard capability list.
pub fn find_capability(dev: &Device, id: u8) -> Option<u16> {
    let status = dev.config.get_word(cfg_space::offset::STATUS);
    if status & cfg_space::STATUS_CAP_LIST == 0 {
        return None;
    }
    let mut pos = u16::from(dev.config.get_byte(cfg_space::offset::CAPABILITY_PTR) & 0xfc);
    for _ in 0..MAX_CAP_CHAIN {
        if pos == 0 {
            return None;
        }
        if dev.config.get_byte(pos) == id {
            return Some(pos);
        }
        pos = u16::from(dev.config.get_byte(pos + caps::NEXT_PTR) & 0xfc);
    }
    None
}

fn express_cap(dev: &Device) -> Option<u16> {
    find_capability(dev, caps::ids::PCI_EXPRESS)
}

/// The device's express port type, if it carries the express capability.
pub fn device_type(dev: &Device) -> Option<DevicePortType> {
    let cap = express_cap(dev)?;
    let flags = PciExpressFlags::from(dev.config.get_word(cap + pci_express::offset::PCIE_FLAGS));
    Some(flags.device_port_type())
}

/// Whether the device is a switch downstream port.
pub fn is_downstream_port(dev: &Device) -> bool {
    device_type(dev) == Some(DevicePortType::DownstreamSwitchPort)
}

/// Whether the device is a switch upstream port.
pub fn is_upstream_port(dev: &Device) -> bool {
    device_type(dev) == Some(DevicePortType::UpstreamSwitchPort)
}

/// Whether the port's data link layer reports the link up.
pub fn data_link_active(dev: &Device) -> bool {
    let Some(cap) = express_cap(dev) else {
        return false;
    };
    let status = LinkStatus::from(dev.config.get_word(cap + pci_express::offset::LINK_STATUS));
    status.data_link_layer_link_active()
}

/// The device's power state, if it carries the power management capability.
pub fn power_state(dev: &Device) -> Option<PowerState> {
    let cap = find_capability(dev, caps::ids::POWER_MANAGEMENT)?;
    let ctrl = power_management::PowerManagementControl::from(
        dev.config.get_word(cap + power_management::offset::PM_CTRL),
    );
    Some(ctrl.power_state())
}

/// Compares the negotiated link against the capable link.
///
/// Only strictly lower negotiated values count as degraded. A link that
/// negotiated above its advertised capability is left alone.
pub fn classify_link(
    capable_speed: u16,
    capable_width: u16,
    negotiated_speed: u16,
    negotiated_width: u16,
) -> LinkQuality {
    let slow = negotiated_speed < capable_speed;
    let narrow = negotiated_width < capable_width;
    match (slow, narrow) {
        (false, false) => LinkQuality::Ideal,
        (true, false) => LinkQuality::SpeedDegraded,
        (false, true) => LinkQuality::WidthDegraded,
        (true, true) => LinkQuality::BothDegraded,
    }
}

/// The port's link quality, if it carries the express capability.
pub fn link_quality(dev: &Device) -> Option<LinkQuality> {
    let cap = express_cap(dev)?;
    let caps = LinkCapabilities::from(dev.config.get_long(cap + pci_express::offset::LINK_CAPS));
    let status = LinkStatus::from(dev.config.get_word(cap + pci_express::offset::LINK_STATUS));
    Some(classify_link(
        caps.max_link_speed() as u16,
        caps.max_link_width() as u16,
        status.current_link_speed().into(),
        status.negotiated_link_width().into(),
    ))
}

/// Whether the hub fronted by bridge `dev` is responding, judged by the
/// kernel having enumerated at least one function behind it.
pub fn hub_alive(topology: &Topology, dev: &Device) -> bool {
    topology.child_count(dev) > 0
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus scanning: enumerate functions, pick out the supported switch and hub
//! silicon, and build a topology snapshot.

use crate::cache::ConfigCache;
use crate::host::HostError;
use crate::host::HostPci;
use crate::link;
use crate::topology::Device;
use crate::topology::Topology;
use pcie_spec::caps::pci_express::DevicePortType;
use pcie_spec::cfg_space::class;

/// Identity of a supported chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetId {
    /// PCI vendor ID.
    pub vendor_id: u16,
    /// PCI device ID.
    pub device_id: u16,
    /// Class and subclass word.
    pub class: u16,
}

/// The switch and hub silicon the supervisor manages.
pub const TARGET_DEVICES: &[TargetId] = &[
    // PLX PEX8608 switch ports.
    TargetId {
        vendor_id: 0x10b5,
        device_id: 0x8608,
        class: class::BRIDGE_PCI,
    },
    // TI TUSB8041 hub.
    TargetId {
        vendor_id: 0x104c,
        device_id: 0x8241,
        class: class::SERIAL_USB,
    },
];

/// Whether the identity triple names a supported chip.
pub fn is_target_device(vendor_id: u16, device_id: u16, class: u16) -> bool {
    TARGET_DEVICES.iter().any(|t| {
        t.vendor_id == vendor_id && t.device_id == device_id && t.class == class
    })
}

/// The result of one bus scan.
#[derive(Debug)]
pub struct BusSnapshot {
    /// Hierarchy of the supported devices found.
    pub topology: Topology,
    /// Whether any function outside domain 0 was seen.
    pub nonzero_domain_seen: bool,
    /// How many functions were dropped because their configuration space
    /// could not be read.
    pub read_errors: u32,
}

/// Scans the bus for supported devices.
///
/// Functions whose configuration space cannot be read are counted in
/// [`BusSnapshot::read_errors`] and dropped; only a failure to enumerate the
/// bus itself is fatal.
pub fn scan_bus<H: HostPci + ?Sized>(host: &H) -> Result<BusSnapshot, HostError> {
    let mut devices = Vec::new();
    let mut nonzero_domain_seen = false;
    let mut read_errors = 0;

    for bdf in host.list_functions()? {
        if bdf.domain != 0 {
            nonzero_domain_seen = true;
        }

        let mut header = [0u8; 16];
        if let Err(err) = host.read_config(bdf, 0, &mut header) {
            tracing::warn!(
                %bdf,
                error = &err as &dyn std::error::Error,
                "skipping function, header unreadable"
            );
            read_errors += 1;
            continue;
        }
        let vendor_id = u16::from_le_bytes([header[0], header[1]]);
        if vendor_id == 0xffff || vendor_id == 0 {
            continue;
        }
        let device_id = u16::from_le_bytes([header[2], header[3]]);
        let class = u16::from_le_bytes([header[0x0a], header[0x0b]]);
        if !is_target_device(vendor_id, device_id, class) {
            continue;
        }

        let mut config = ConfigCache::new();
        if !config.fetch(host, bdf, 0, 256) {
            read_errors += 1;
            continue;
        }
        devices.push(Device::new(bdf, config));
    }

    devices.sort_unstable_by_key(|d| d.bdf);

    let mut downstream_number = 0;
    for dev in &mut devices {
        if link::device_type(dev) == Some(DevicePortType::DownstreamSwitchPort) {
            downstream_number += 1;
            dev.downstream_number = downstream_number;
        }
    }

    Ok(BusSnapshot {
        topology: Topology::build(devices),
        nonzero_domain_seen,
        read_errors,
    })
}

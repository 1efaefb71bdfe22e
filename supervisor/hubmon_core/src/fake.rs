// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted in-memory host for tests: synthetic configuration spaces, a
//! function list that reacts to remove and rescan, and a recorded action
//! log.

use crate::host::HostError;
use crate::host::HostPci;
use parking_lot::Mutex;
use pci_sysfs::Bdf;
use pci_sysfs::SysfsError;
use pcie_spec::caps;
use pcie_spec::caps::pci_express::DevicePortType;
use pcie_spec::caps::pci_express::LinkCapabilities;
use pcie_spec::caps::pci_express::LinkStatus;
use pcie_spec::caps::pci_express::PciExpressFlags;
use pcie_spec::caps::pci_express::SlotCapabilities;
use pcie_spec::caps::pci_express::SlotStatus;
use pcie_spec::caps::power_management::PowerManagementControl;
use pcie_spec::caps::power_management::PowerState;
use pcie_spec::cfg_space;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io;

/// The standard test tree's upstream switch port.
pub(crate) const UPSTREAM: Bdf = Bdf::new(0, 1, 0, 0);
/// The standard test tree's downstream switch port.
pub(crate) const PORT: Bdf = Bdf::new(0, 2, 1, 0);
/// The standard test tree's hub, behind [`PORT`].
pub(crate) const HUB: Bdf = Bdf::new(0, 3, 0, 0);

/// One host side effect, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Rescan,
    Remove(Bdf),
    Settle,
    RegRead(Bdf, u64),
    RegWrite(Bdf, u64, u32),
}

#[derive(Default)]
struct FakeState {
    configs: HashMap<Bdf, Vec<u8>>,
    detached: HashSet<Bdf>,
    removed: HashSet<Bdf>,
    registers: HashMap<(Bdf, u64), u32>,
    actions: Vec<Action>,
    config_reads: u32,
    failing_configs: HashSet<Bdf>,
}

/// In-memory [`HostPci`] implementation.
pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Adds a function with the given configuration space bytes.
    pub(crate) fn add_function(&self, bdf: Bdf, config: Vec<u8>) {
        self.state.lock().configs.insert(bdf, config);
    }

    /// Replaces a function's configuration space bytes.
    pub(crate) fn set_function_config(&self, bdf: Bdf, config: Vec<u8>) {
        self.state.lock().configs.insert(bdf, config);
    }

    /// Unplugs a function. It stays gone across rescans until
    /// [`Self::attach`].
    pub(crate) fn detach(&self, bdf: Bdf) {
        self.state.lock().detached.insert(bdf);
    }

    /// Replugs a detached function. Visible again after the next rescan or
    /// immediately if it was never removed.
    pub(crate) fn attach(&self, bdf: Bdf) {
        self.state.lock().detached.remove(&bdf);
    }

    /// Makes every configuration read of `bdf` fail.
    pub(crate) fn fail_config_reads_for(&self, bdf: Bdf) {
        self.state.lock().failing_configs.insert(bdf);
    }

    /// Total configuration space reads served so far.
    pub(crate) fn config_reads(&self) -> u32 {
        self.state.lock().config_reads
    }

    /// Drains the recorded action log.
    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.state.lock().actions)
    }

    /// Current value of a BAR register, zero if never written.
    pub(crate) fn register(&self, bdf: Bdf, offset: u64) -> u32 {
        self.state
            .lock()
            .registers
            .get(&(bdf, offset))
            .copied()
            .unwrap_or(0)
    }
}

fn read_error(bdf: Bdf, message: &str) -> HostError {
    HostError::Sysfs(SysfsError::ReadConfig {
        bdf,
        source: io::Error::other(message.to_owned()),
    })
}

impl HostPci for FakeHost {
    fn list_functions(&self) -> Result<Vec<Bdf>, HostError> {
        let state = self.state.lock();
        let mut functions: Vec<Bdf> = state
            .configs
            .keys()
            .filter(|bdf| !state.detached.contains(bdf) && !state.removed.contains(bdf))
            .copied()
            .collect();
        functions.sort_unstable();
        Ok(functions)
    }

    fn read_config(&self, bdf: Bdf, offset: u16, buf: &mut [u8]) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.config_reads += 1;
        if state.failing_configs.contains(&bdf) {
            return Err(read_error(bdf, "injected config read failure"));
        }
        if state.detached.contains(&bdf) || state.removed.contains(&bdf) {
            return Err(read_error(bdf, "function not present"));
        }
        let Some(config) = state.configs.get(&bdf) else {
            return Err(read_error(bdf, "no such function"));
        };
        let start = usize::from(offset);
        let Some(bytes) = config.get(start..start + buf.len()) else {
            return Err(read_error(bdf, "read past end of config space"));
        };
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn remove_function(&self, bdf: Bdf) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.actions.push(Action::Remove(bdf));
        state.removed.insert(bdf);
        Ok(())
    }

    fn rescan_bus(&self) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.actions.push(Action::Rescan);
        state.removed.clear();
        Ok(())
    }

    fn read_register(&self, bdf: Bdf, offset: u64) -> Result<u32, HostError> {
        let mut state = self.state.lock();
        state.actions.push(Action::RegRead(bdf, offset));
        Ok(state.registers.get(&(bdf, offset)).copied().unwrap_or(0))
    }

    fn write_register(&self, bdf: Bdf, offset: u64, value: u32) -> Result<u32, HostError> {
        let mut state = self.state.lock();
        state.actions.push(Action::RegWrite(bdf, offset, value));
        state.registers.insert((bdf, offset), value);
        Ok(value)
    }

    fn settle(&self) {
        self.state.lock().actions.push(Action::Settle);
    }
}

/// Builder for synthetic 256-byte configuration spaces.
#[derive(Clone)]
pub(crate) struct ConfigBuilder {
    vendor_id: u16,
    device_id: u16,
    class: u16,
    header_type: u8,
    secondary_bus: Option<u8>,
    capabilities: bool,
    port_type: DevicePortType,
    dl_active: bool,
    power_state: PowerState,
    capable: (u16, u16),
    negotiated: (u16, u16),
    slot_implemented: bool,
    slot_occupied: bool,
}

impl ConfigBuilder {
    /// A type 1 header with the express capability of a switch port.
    pub(crate) fn bridge(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
            class: cfg_space::class::BRIDGE_PCI,
            header_type: cfg_space::HEADER_TYPE_BRIDGE,
            secondary_bus: None,
            capabilities: true,
            port_type: DevicePortType::DownstreamSwitchPort,
            dl_active: true,
            power_state: PowerState::D0,
            capable: (3, 4),
            negotiated: (3, 4),
            slot_implemented: false,
            slot_occupied: false,
        }
    }

    /// A type 0 header with endpoint capabilities.
    pub(crate) fn endpoint(vendor_id: u16, device_id: u16) -> Self {
        Self {
            vendor_id,
            device_id,
            class: cfg_space::class::SERIAL_USB,
            header_type: cfg_space::HEADER_TYPE_DEVICE,
            secondary_bus: None,
            capabilities: true,
            port_type: DevicePortType::Endpoint,
            dl_active: true,
            power_state: PowerState::D0,
            capable: (3, 1),
            negotiated: (3, 1),
            slot_implemented: false,
            slot_occupied: false,
        }
    }

    pub(crate) fn secondary_bus(mut self, bus: u8) -> Self {
        self.secondary_bus = Some(bus);
        self
    }

    pub(crate) fn port_type(mut self, port_type: DevicePortType) -> Self {
        self.port_type = port_type;
        self
    }

    pub(crate) fn dl_active(mut self, active: bool) -> Self {
        self.dl_active = active;
        self
    }

    pub(crate) fn power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    pub(crate) fn link_capable(mut self, speed: u16, width: u16) -> Self {
        self.capable = (speed, width);
        self
    }

    pub(crate) fn link_negotiated(mut self, speed: u16, width: u16) -> Self {
        self.negotiated = (speed, width);
        self
    }

    pub(crate) fn slot(mut self, occupied: bool) -> Self {
        self.slot_implemented = true;
        self.slot_occupied = occupied;
        self
    }

    pub(crate) fn without_capabilities(mut self) -> Self {
        self.capabilities = false;
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        const PM_CAP: usize = 0x40;
        const EXPRESS_CAP: usize = 0x48;

        let mut bytes = vec![0u8; 256];
        let put16 = |bytes: &mut [u8], pos: usize, value: u16| {
            bytes[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
        };
        let put32 = |bytes: &mut [u8], pos: usize, value: u32| {
            bytes[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
        };

        put16(&mut bytes, 0x00, self.vendor_id);
        put16(&mut bytes, 0x02, self.device_id);
        put16(&mut bytes, 0x0a, self.class);
        bytes[0x0e] = self.header_type;
        if let Some(bus) = self.secondary_bus {
            bytes[0x19] = bus;
        }
        if !self.capabilities {
            return bytes;
        }

        put16(&mut bytes, 0x06, cfg_space::STATUS_CAP_LIST);
        bytes[usize::from(cfg_space::offset::CAPABILITY_PTR)] = PM_CAP as u8;

        bytes[PM_CAP] = caps::ids::POWER_MANAGEMENT;
        bytes[PM_CAP + 1] = EXPRESS_CAP as u8;
        let pm_ctrl = PowerManagementControl::new().with_power_state(self.power_state);
        put16(
            &mut bytes,
            PM_CAP + usize::from(caps::power_management::offset::PM_CTRL),
            pm_ctrl.into(),
        );

        use pcie_spec::caps::pci_express::offset;
        bytes[EXPRESS_CAP] = caps::ids::PCI_EXPRESS;
        bytes[EXPRESS_CAP + 1] = 0;
        let flags = PciExpressFlags::new()
            .with_capability_version(2)
            .with_device_port_type(self.port_type)
            .with_slot_implemented(self.slot_implemented);
        put16(
            &mut bytes,
            EXPRESS_CAP + usize::from(offset::PCIE_FLAGS),
            flags.into(),
        );
        let link_caps = LinkCapabilities::new()
            .with_max_link_speed(self.capable.0.into())
            .with_max_link_width(self.capable.1.into())
            .with_data_link_layer_link_active_reporting(true);
        put32(
            &mut bytes,
            EXPRESS_CAP + usize::from(offset::LINK_CAPS),
            link_caps.into(),
        );
        let link_status = LinkStatus::new()
            .with_current_link_speed(self.negotiated.0)
            .with_negotiated_link_width(self.negotiated.1)
            .with_data_link_layer_link_active(self.dl_active);
        put16(
            &mut bytes,
            EXPRESS_CAP + usize::from(offset::LINK_STATUS),
            link_status.into(),
        );
        if self.slot_implemented {
            let slot_caps = SlotCapabilities::new()
                .with_hot_plug_capable(true)
                .with_physical_slot_number(u32::from(PORT.device));
            put32(
                &mut bytes,
                EXPRESS_CAP + usize::from(offset::SLOT_CAPS),
                slot_caps.into(),
            );
            let slot_status = SlotStatus::new().with_presence_detect_state(self.slot_occupied);
            put16(
                &mut bytes,
                EXPRESS_CAP + usize::from(offset::SLOT_STATUS),
                slot_status.into(),
            );
        }
        bytes
    }
}

/// The standard three-device tree: upstream port, downstream port, hub.
pub(crate) fn build_standard_tree(
    host: &FakeHost,
    hub_mod: impl FnOnce(ConfigBuilder) -> ConfigBuilder,
) {
    host.add_function(
        UPSTREAM,
        ConfigBuilder::bridge(0x10b5, 0x8608)
            .secondary_bus(2)
            .port_type(DevicePortType::UpstreamSwitchPort)
            .build(),
    );
    host.add_function(PORT, port_config(true));
    host.add_function(HUB, hub_mod(ConfigBuilder::endpoint(0x104c, 0x8241)).build());
}

/// The downstream port's configuration space, with the data link state
/// under test control.
pub(crate) fn port_config(dl_active: bool) -> Vec<u8> {
    ConfigBuilder::bridge(0x10b5, 0x8608)
        .secondary_bus(3)
        .port_type(DevicePortType::DownstreamSwitchPort)
        .dl_active(dl_active)
        .build()
}

/// A [`FakeHost`] pre-populated with the standard tree.
pub(crate) fn standard_tree() -> FakeHost {
    let host = FakeHost::new();
    build_standard_tree(&host, |hub| hub);
    host
}

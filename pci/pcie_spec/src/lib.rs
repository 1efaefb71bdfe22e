// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI and PCI Express register layout definitions.
//!
//! Only the configuration-space structures the hotplug supervisor actually
//! decodes are defined here: the common header fields, the power management
//! and PCI Express capabilities, and the switch vendor registers used for
//! downstream port control.

#![forbid(unsafe_code)]
#![expect(missing_docs)]

pub mod cfg_space {
    //! Common configuration space header layout (types 0 and 1).

    pub mod offset {
        pub const VENDOR_ID: u16 = 0x00;
        pub const DEVICE_ID: u16 = 0x02;
        pub const COMMAND: u16 = 0x04;
        pub const STATUS: u16 = 0x06;
        pub const CLASS_DEVICE: u16 = 0x0a;
        pub const HEADER_TYPE: u16 = 0x0e;
        pub const PRIMARY_BUS: u16 = 0x18;
        pub const SECONDARY_BUS: u16 = 0x19;
        pub const SUBORDINATE_BUS: u16 = 0x1a;
        pub const CAPABILITY_PTR: u16 = 0x34;
    }

    /// Capability-list-present bit in the status register.
    pub const STATUS_CAP_LIST: u16 = 0x0010;

    /// Header type field values (low seven bits of the header type byte).
    pub const HEADER_TYPE_DEVICE: u8 = 0x00;
    pub const HEADER_TYPE_BRIDGE: u8 = 0x01;
    pub const HEADER_TYPE_MASK: u8 = 0x7f;
    pub const HEADER_TYPE_MULTIFUNCTION: u8 = 0x80;

    /// Total configuration space size for a conventional function.
    pub const CFG_SPACE_SIZE: usize = 4096;

    /// 16-bit device class codes, base class in the high byte.
    pub mod class {
        pub const BRIDGE_PCI: u16 = 0x0604;
        pub const SERIAL_USB: u16 = 0x0c03;
    }
}

pub mod caps {
    //! Capability list structures.

    /// Capability IDs assigned by the PCI specification.
    pub mod ids {
        pub const POWER_MANAGEMENT: u8 = 0x01;
        pub const PCI_EXPRESS: u8 = 0x10;
    }

    /// Offset of the next-pointer byte within any capability header.
    pub const NEXT_PTR: u16 = 0x01;

    pub mod power_management {
        //! Power management capability registers.

        use bitfield_struct::bitfield;
        use zerocopy::FromBytes;
        use zerocopy::Immutable;
        use zerocopy::IntoBytes;
        use zerocopy::KnownLayout;

        pub mod offset {
            pub const PM_CAPS: u16 = 0x02;
            pub const PM_CTRL: u16 = 0x04;
        }

        /// Power Management Control/Status Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct PowerManagementControl {
            #[bits(2)]
            pub power_state: PowerState,
            _reserved: bool,
            pub no_soft_reset: bool,
            #[bits(4)]
            _reserved2: u16,
            pub pme_enable: bool,
            #[bits(4)]
            pub data_select: u16,
            #[bits(2)]
            pub data_scale: u16,
            pub pme_status: bool,
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum PowerState {
            D0 = 0b00,
            D1 = 0b01,
            D2 = 0b10,
            D3Hot = 0b11,
        }

        impl PowerState {
            const fn from_bits(bits: u16) -> Self {
                match bits {
                    0b00 => PowerState::D0,
                    0b01 => PowerState::D1,
                    0b10 => PowerState::D2,
                    _ => PowerState::D3Hot,
                }
            }

            const fn into_bits(self) -> u16 {
                self as u16
            }
        }
    }

    pub mod pci_express {
        //! PCI Express capability registers.

        use bitfield_struct::bitfield;
        use zerocopy::FromBytes;
        use zerocopy::Immutable;
        use zerocopy::IntoBytes;
        use zerocopy::KnownLayout;

        pub mod offset {
            pub const PCIE_FLAGS: u16 = 0x02;
            pub const DEVICE_CAPS: u16 = 0x04;
            pub const DEVICE_CONTROL: u16 = 0x08;
            pub const DEVICE_STATUS: u16 = 0x0a;
            pub const LINK_CAPS: u16 = 0x0c;
            pub const LINK_CONTROL: u16 = 0x10;
            pub const LINK_STATUS: u16 = 0x12;
            pub const SLOT_CAPS: u16 = 0x14;
            pub const SLOT_CONTROL: u16 = 0x18;
            pub const SLOT_STATUS: u16 = 0x1a;
            pub const LINK_CONTROL_2: u16 = 0x30;
            pub const LINK_STATUS_2: u16 = 0x32;
        }

        /// PCI Express Capabilities Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct PciExpressFlags {
            #[bits(4)]
            pub capability_version: u16,
            #[bits(4)]
            pub device_port_type: DevicePortType,
            pub slot_implemented: bool,
            #[bits(5)]
            pub interrupt_message_number: u16,
            pub _undefined: bool,
            pub flit_mode_supported: bool,
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum DevicePortType {
            Endpoint = 0b0000,
            LegacyEndpoint = 0b0001,
            RootPort = 0b0100,
            UpstreamSwitchPort = 0b0101,
            DownstreamSwitchPort = 0b0110,
            PcieToPciBridge = 0b0111,
            PciToPcieBridge = 0b1000,
            RootComplexIntegratedEndpoint = 0b1001,
            RootComplexEventCollector = 0b1010,
            Reserved = 0b1111,
        }

        impl DevicePortType {
            const fn from_bits(bits: u16) -> Self {
                match bits {
                    0b0000 => DevicePortType::Endpoint,
                    0b0001 => DevicePortType::LegacyEndpoint,
                    0b0100 => DevicePortType::RootPort,
                    0b0101 => DevicePortType::UpstreamSwitchPort,
                    0b0110 => DevicePortType::DownstreamSwitchPort,
                    0b0111 => DevicePortType::PcieToPciBridge,
                    0b1000 => DevicePortType::PciToPcieBridge,
                    0b1001 => DevicePortType::RootComplexIntegratedEndpoint,
                    0b1010 => DevicePortType::RootComplexEventCollector,
                    _ => DevicePortType::Reserved,
                }
            }

            const fn into_bits(self) -> u16 {
                self as u16
            }
        }

        /// Link Capabilities Register
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct LinkCapabilities {
            #[bits(4)]
            pub max_link_speed: u32,
            #[bits(6)]
            pub max_link_width: u32,
            #[bits(2)]
            pub aspm_support: u32,
            #[bits(3)]
            pub l0s_exit_latency: u32,
            #[bits(3)]
            pub l1_exit_latency: u32,
            pub clock_power_management: bool,
            pub surprise_down_error_reporting: bool,
            pub data_link_layer_link_active_reporting: bool,
            pub link_bandwidth_notification_capability: bool,
            pub aspm_optionality_compliance: bool,
            _reserved: bool,
            #[bits(8)]
            pub port_number: u32,
        }

        /// Link Status Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct LinkStatus {
            #[bits(4)]
            pub current_link_speed: u16,
            #[bits(6)]
            pub negotiated_link_width: u16,
            pub _undefined: bool,
            pub link_training: bool,
            pub slot_clock_configuration: bool,
            pub data_link_layer_link_active: bool,
            pub link_bandwidth_management_status: bool,
            pub link_autonomous_bandwidth_status: bool,
        }

        /// Link Control 2 Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct LinkControl2 {
            #[bits(4)]
            pub target_link_speed: u16,
            pub enter_compliance: bool,
            pub hardware_autonomous_speed_disable: bool,
            pub selectable_deemphasis: bool,
            #[bits(3)]
            pub transmit_margin: u16,
            pub enter_modified_compliance: bool,
            pub compliance_sos: bool,
            #[bits(4)]
            pub compliance_preset_deemphasis: u16,
        }

        /// Device Status Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct DeviceStatus {
            pub correctable_error_detected: bool,
            pub non_fatal_error_detected: bool,
            pub fatal_error_detected: bool,
            pub unsupported_request_detected: bool,
            pub aux_power_detected: bool,
            pub transactions_pending: bool,
            #[bits(10)]
            _reserved: u16,
        }

        /// Slot Capabilities Register
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct SlotCapabilities {
            pub attention_button_present: bool,
            pub power_controller_present: bool,
            pub mrl_sensor_present: bool,
            pub attention_indicator_present: bool,
            pub power_indicator_present: bool,
            pub hot_plug_surprise: bool,
            pub hot_plug_capable: bool,
            #[bits(8)]
            pub slot_power_limit_value: u32,
            #[bits(2)]
            pub slot_power_limit_scale: u32,
            pub electromechanical_interlock_present: bool,
            pub no_command_completed_support: bool,
            #[bits(13)]
            pub physical_slot_number: u32,
        }

        /// Slot Status Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct SlotStatus {
            pub attention_button_pressed: bool,
            pub power_fault_detected: bool,
            pub mrl_sensor_changed: bool,
            pub presence_detect_changed: bool,
            pub command_completed: bool,
            pub mrl_sensor_state: bool,
            pub presence_detect_state: bool,
            pub electromechanical_interlock_status: bool,
            pub data_link_layer_state_changed: bool,
            #[bits(7)]
            _reserved: u16,
        }

        /// Human-readable name for an encoded link speed value.
        pub const fn link_speed_name(speed: u16) -> &'static str {
            match speed {
                1 => "2.5GT/s",
                2 => "5GT/s",
                3 => "8GT/s",
                4 => "16GT/s",
                5 => "32GT/s",
                6 => "64GT/s",
                _ => "unknown",
            }
        }
    }
}

pub mod switch {
    //! Vendor registers of the supported switch, relative to the upstream
    //! port's BAR0 base.

    /// Downstream port disable control register.
    pub const PORT_DISABLE: u64 = 0x0234;

    /// Disable bit within [`PORT_DISABLE`]; set to hold the port down,
    /// clear to release it.
    pub const PORT_DISABLE_BIT: u32 = 1 << 0;
}

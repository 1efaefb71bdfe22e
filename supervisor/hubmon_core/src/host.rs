// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host PCI surface the supervisor runs against.
//!
//! Everything the monitoring cycle does to the machine goes through
//! [`HostPci`], so tests can substitute a scripted fake for the real sysfs
//! tree and BAR mappings.

use bar_mmap::RegisterError;
use pci_sysfs::Bdf;
use pci_sysfs::PciSysfs;
use pci_sysfs::SysfsError;
use std::time::Duration;
use thiserror::Error;

/// How long to wait for the kernel to finish re-enumerating after a rescan.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// A host operation failure.
#[derive(Debug, Error)]
pub enum HostError {
    /// A sysfs operation failed.
    #[error(transparent)]
    Sysfs(#[from] SysfsError),
    /// A BAR register access failed.
    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Operations the supervisor needs from the host's PCI subsystem.
pub trait HostPci {
    /// Lists every enumerated PCI function, in canonical order.
    fn list_functions(&self) -> Result<Vec<Bdf>, HostError>;

    /// Reads `buf.len()` bytes of `bdf`'s configuration space at `offset`.
    fn read_config(&self, bdf: Bdf, offset: u16, buf: &mut [u8]) -> Result<(), HostError>;

    /// Removes `bdf` from the bus.
    fn remove_function(&self, bdf: Bdf) -> Result<(), HostError>;

    /// Triggers a full bus rescan.
    fn rescan_bus(&self) -> Result<(), HostError>;

    /// Reads the 32-bit register at `offset` in `bdf`'s first BAR.
    fn read_register(&self, bdf: Bdf, offset: u64) -> Result<u32, HostError>;

    /// Writes the 32-bit register at `offset` in `bdf`'s first BAR and
    /// returns the readback value.
    fn write_register(&self, bdf: Bdf, offset: u64, value: u32) -> Result<u32, HostError>;

    /// Blocks until the bus has had time to settle after a rescan.
    fn settle(&self);
}

/// The production host, backed by sysfs and BAR resource files.
#[derive(Debug)]
pub struct SysfsHost {
    sysfs: PciSysfs,
}

impl SysfsHost {
    /// Creates a host over the production sysfs tree.
    pub fn new() -> Self {
        Self {
            sysfs: PciSysfs::new(),
        }
    }

    /// Creates a host over a sysfs tree rooted elsewhere.
    pub fn with_sysfs(sysfs: PciSysfs) -> Self {
        Self { sysfs }
    }
}

impl Default for SysfsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPci for SysfsHost {
    fn list_functions(&self) -> Result<Vec<Bdf>, HostError> {
        Ok(self.sysfs.list_functions()?)
    }

    fn read_config(&self, bdf: Bdf, offset: u16, buf: &mut [u8]) -> Result<(), HostError> {
        Ok(self.sysfs.read_config(bdf, offset.into(), buf)?)
    }

    fn remove_function(&self, bdf: Bdf) -> Result<(), HostError> {
        Ok(self.sysfs.remove_function(bdf)?)
    }

    fn rescan_bus(&self) -> Result<(), HostError> {
        Ok(self.sysfs.rescan_bus()?)
    }

    fn read_register(&self, bdf: Bdf, offset: u64) -> Result<u32, HostError> {
        Ok(bar_mmap::read_register(
            &self.sysfs.resource0_path(bdf),
            offset,
        )?)
    }

    fn write_register(&self, bdf: Bdf, offset: u64, value: u32) -> Result<u32, HostError> {
        Ok(bar_mmap::write_register(
            &self.sysfs.resource0_path(bdf),
            offset,
            value,
        )?)
    }

    fn settle(&self) {
        std::thread::sleep(SETTLE_DELAY);
    }
}

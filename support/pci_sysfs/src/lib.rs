// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The kernel's PCI sysfs surface: function enumeration, configuration
//! space reads, and the `remove`/`rescan` hotplug controls.
//!
//! All paths hang off a configurable root (`/sys/bus/pci` in production) so
//! tests can point the whole crate at a scratch directory.

#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// The production sysfs root for the PCI bus.
pub const SYSFS_PCI_ROOT: &str = "/sys/bus/pci";

/// A PCI function address: domain, bus, device (slot), function.
///
/// Orders by (domain, bus, device, function), which is also the canonical
/// scan order. Displays in the full sysfs form `DDDD:BB:SS.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    /// PCI domain (segment) number.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device (slot) number.
    pub device: u8,
    /// Function number.
    pub function: u8,
}

impl Bdf {
    /// Creates an address from its four components.
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Error parsing a PCI function address.
#[derive(Debug, Error)]
#[error("malformed pci address {0:?}")]
pub struct BdfParseError(String);

impl FromStr for Bdf {
    type Err = BdfParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || BdfParseError(s.to_owned());
        let int_err = |_: ParseIntError| BdfParseError(s.to_owned());

        let (rest, function) = s.rsplit_once('.').ok_or_else(err)?;
        let parts = rest.split(':').collect::<Vec<_>>();
        let (domain, bus, device) = match parts.as_slice() {
            [domain, bus, device] => (u16::from_str_radix(domain, 16).map_err(int_err)?, bus, device),
            [bus, device] => (0, bus, device),
            _ => return Err(err()),
        };
        Ok(Self {
            domain,
            bus: u8::from_str_radix(bus, 16).map_err(int_err)?,
            device: u8::from_str_radix(device, 16).map_err(int_err)?,
            function: u8::from_str_radix(function, 16).map_err(int_err)?,
        })
    }
}

/// Failures of the sysfs surface.
#[derive(Debug, Error)]
pub enum SysfsError {
    /// The device directory could not be enumerated.
    #[error("failed to enumerate pci functions")]
    Enumerate(#[source] io::Error),
    /// A configuration space read failed.
    #[error("failed to read config space of {bdf}")]
    ReadConfig {
        /// The function whose config space was read.
        bdf: Bdf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The `remove` control write failed.
    #[error("failed to remove {bdf}")]
    Remove {
        /// The function being removed.
        bdf: Bdf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The bus `rescan` control write failed.
    #[error("failed to trigger pci bus rescan")]
    Rescan(#[source] io::Error),
}

/// Handle to a PCI sysfs tree.
#[derive(Debug, Clone)]
pub struct PciSysfs {
    root: PathBuf,
}

impl PciSysfs {
    /// Opens the production sysfs tree at [`SYSFS_PCI_ROOT`].
    pub fn new() -> Self {
        Self::with_root(SYSFS_PCI_ROOT)
    }

    /// Opens a sysfs tree rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the function's sysfs device directory.
    pub fn device_path(&self, bdf: Bdf) -> PathBuf {
        self.root.join("devices").join(bdf.to_string())
    }

    /// Path of the function's first BAR resource file, the register I/O
    /// mmap target.
    pub fn resource0_path(&self, bdf: Bdf) -> PathBuf {
        self.device_path(bdf).join("resource0")
    }

    /// Lists every enumerated PCI function, in canonical order.
    pub fn list_functions(&self) -> Result<Vec<Bdf>, SysfsError> {
        let mut functions = Vec::new();
        for entry in
            fs_err::read_dir(self.root.join("devices")).map_err(SysfsError::Enumerate)?
        {
            let entry = entry.map_err(SysfsError::Enumerate)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Anything that doesn't parse as a function address is not a
            // device node.
            if let Ok(bdf) = name.parse::<Bdf>() {
                functions.push(bdf);
            }
        }
        functions.sort_unstable();
        Ok(functions)
    }

    /// Reads `buf.len()` bytes of the function's configuration space
    /// starting at `offset`.
    pub fn read_config(&self, bdf: Bdf, offset: u64, buf: &mut [u8]) -> Result<(), SysfsError> {
        let mut read = |path| -> io::Result<()> {
            let mut file = fs_err::File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)?;
            Ok(())
        };
        read(self.device_path(bdf).join("config"))
            .map_err(|source| SysfsError::ReadConfig { bdf, source })
    }

    /// Removes the function from the bus by writing its `remove` control.
    pub fn remove_function(&self, bdf: Bdf) -> Result<(), SysfsError> {
        tracing::info!(%bdf, "removing pci function");
        fs_err::write(self.device_path(bdf).join("remove"), "1")
            .map_err(|source| SysfsError::Remove { bdf, source })
    }

    /// Triggers a full bus rescan by writing the bus `rescan` control.
    pub fn rescan_bus(&self) -> Result<(), SysfsError> {
        tracing::info!("rescanning pci bus");
        fs_err::write(self.root.join("rescan"), "1").map_err(SysfsError::Rescan)
    }
}

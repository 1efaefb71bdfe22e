// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! 32-bit register access over memory-mapped PCI BAR resource files.
//!
//! Each access opens the device's sysfs `resource0` file, maps the page (or
//! pages) covering the requested register, performs a single volatile 32-bit
//! access, then unmaps and closes before returning. Nothing is cached across
//! calls, so a failed access can never leak a descriptor or mapping into a
//! later monitoring cycle.

// UNSAFETY: mmap of device memory and volatile pointer access.
#![expect(unsafe_code)]

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use thiserror::Error;

/// Failures of a single register access.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The requested offset does not address a 32-bit register.
    #[error("register offset {0:#x} is not 4-byte aligned")]
    Misaligned(u64),
    /// The resource file could not be opened.
    #[error("failed to open {path}")]
    Open {
        /// The resource file path.
        path: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The resource file could not be mapped.
    #[error("failed to map {len:#x} bytes of {path} at {offset:#x}")]
    Map {
        /// The resource file path.
        path: String,
        /// Page-aligned mapping offset.
        offset: u64,
        /// Mapping length.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The mapping could not be released. Treated as fatal by callers since
    /// a stuck mapping corrupts future cycles.
    #[error("failed to unmap {path}")]
    Unmap {
        /// The resource file path.
        path: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Gets the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no safety requirements.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mapping {
    fn new(file: &fs::File, path: &Path, offset: u64, len: usize) -> Result<Self, RegisterError> {
        // SAFETY: mapping a fresh region at a kernel-chosen address; no
        // existing Rust memory is affected.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RegisterError::Map {
                path: path.display().to_string(),
                offset,
                len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { ptr, len })
    }

    /// Releases the mapping, reporting munmap failure instead of swallowing
    /// it the way a plain drop would.
    fn finish(mut self, path: &Path) -> Result<(), RegisterError> {
        let ptr = std::mem::replace(&mut self.ptr, ptr::null_mut());
        // SAFETY: ptr and len came from a successful mmap, and the drop
        // backstop skips the now-null pointer.
        let ret = unsafe { libc::munmap(ptr, self.len) };
        if ret != 0 {
            return Err(RegisterError::Unmap {
                path: path.display().to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr and len came from a successful mmap.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

/// Reads the 32-bit register at `offset` within the BAR backing `resource`.
pub fn read_register(resource: &Path, offset: u64) -> Result<u32, RegisterError> {
    let value = access(resource, offset, None)?;
    tracing::debug!(
        resource = %resource.display(),
        offset = format_args!("{offset:#x}"),
        value = format_args!("{value:#010x}"),
        "register read"
    );
    Ok(value)
}

/// Writes the 32-bit register at `offset` within the BAR backing `resource`.
///
/// Returns the value read back after the write.
pub fn write_register(resource: &Path, offset: u64, value: u32) -> Result<u32, RegisterError> {
    let readback = access(resource, offset, Some(value))?;
    tracing::debug!(
        resource = %resource.display(),
        offset = format_args!("{offset:#x}"),
        value = format_args!("{value:#010x}"),
        readback = format_args!("{readback:#010x}"),
        "register write"
    );
    Ok(readback)
}

fn access(resource: &Path, offset: u64, write: Option<u32>) -> Result<u32, RegisterError> {
    if offset % 4 != 0 {
        return Err(RegisterError::Misaligned(offset));
    }

    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(resource)
        .map_err(|source| RegisterError::Open {
            path: resource.display().to_string(),
            source,
        })?;

    let page = page_size() as u64;
    let map_base = offset & !(page - 1);
    let mut map_len = page as usize;
    // Widen the mapping if the access range crosses its end.
    while offset + 4 > map_base + map_len as u64 {
        map_len *= 2;
    }

    let mapping = Mapping::new(&file, resource, map_base, map_len)?;
    let reg_offset = (offset - map_base) as usize;
    // SAFETY: the register lies within the mapping and is 4-byte aligned.
    let reg = unsafe { mapping.ptr.cast::<u8>().add(reg_offset).cast::<u32>() };
    // SAFETY: volatile access to device memory through a live mapping.
    let value = unsafe {
        if let Some(v) = write {
            ptr::write_volatile(reg, v);
        }
        ptr::read_volatile(reg)
    };
    mapping.finish(resource)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    fn scratch_resource(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn read_returns_stored_value() {
        let mut file = scratch_resource(8192);
        file.as_file_mut().seek(SeekFrom::Start(0x234)).unwrap();
        file.as_file_mut()
            .write_all(&0xdead_beef_u32.to_ne_bytes())
            .unwrap();

        let value = read_register(file.path(), 0x234).unwrap();
        assert_eq!(value, 0xdead_beef);
    }

    #[test]
    fn write_persists_and_reads_back() {
        let mut file = scratch_resource(8192);

        let readback = write_register(file.path(), 0x78, 0x1234_5678).unwrap();
        assert_eq!(readback, 0x1234_5678, "readback must see the new value");

        let mut buf = [0u8; 4];
        file.as_file_mut().seek(SeekFrom::Start(0x78)).unwrap();
        file.as_file_mut().read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), 0x1234_5678);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let file = scratch_resource(8192);
        assert!(matches!(
            read_register(file.path(), 0x236),
            Err(RegisterError::Misaligned(0x236))
        ));
    }

    #[test]
    fn missing_resource_fails_to_open() {
        assert!(matches!(
            read_register(Path::new("/nonexistent/resource0"), 0),
            Err(RegisterError::Open { .. })
        ));
    }

    #[test]
    fn offset_on_later_page_is_reachable() {
        let mut file = scratch_resource(4 * page_size());
        let offset = (2 * page_size() + 0x40) as u64;
        file.as_file_mut().seek(SeekFrom::Start(offset)).unwrap();
        file.as_file_mut()
            .write_all(&0x0bad_cafe_u32.to_ne_bytes())
            .unwrap();

        assert_eq!(read_register(file.path(), offset).unwrap(), 0x0bad_cafe);
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A growable, presence-tracked copy of one function's configuration space.
//!
//! Reads from the kernel are expensive relative to the monitoring period, so
//! the cache fetches ranges once and answers register queries from memory.
//! Every byte is tracked individually: asking for a byte that was never
//! fetched is a caller bug and panics rather than returning stale zeroes.

use crate::host::HostPci;
use pci_sysfs::Bdf;
use pcie_spec::cfg_space;

/// Initial cache capacity, enough for the standard header and the
/// capability list of every supported device.
pub const INITIAL_SIZE: u16 = 256;

/// Cached configuration space bytes for a single function.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    data: Vec<u8>,
    present: Vec<bool>,
}

impl ConfigCache {
    /// Creates an empty cache with the initial capacity.
    pub fn new() -> Self {
        Self {
            data: vec![0; INITIAL_SIZE.into()],
            present: vec![false; INITIAL_SIZE.into()],
        }
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether the byte at `pos` has been fetched.
    pub fn is_present(&self, pos: u16) -> bool {
        self.present.get(usize::from(pos)).copied().unwrap_or(false)
    }

    /// Fetches `len` bytes at `pos` from `bdf`'s configuration space into
    /// the cache, growing it as needed.
    ///
    /// Bytes already present are not re-read. Returns `false` without
    /// modifying the cache if the range is out of bounds or the host read
    /// fails.
    pub fn fetch<H: HostPci + ?Sized>(
        &mut self,
        host: &H,
        bdf: Bdf,
        pos: u16,
        len: u16,
    ) -> bool {
        let Some(end) = pos.checked_add(len) else {
            tracing::warn!(%bdf, pos, len, "config fetch range overflows");
            return false;
        };
        if usize::from(end) > cfg_space::CFG_SPACE_SIZE {
            tracing::warn!(%bdf, pos, len, "config fetch beyond config space");
            return false;
        }
        while usize::from(end) > self.data.len() {
            self.grow();
        }

        // Trim the range down to the bytes not yet present.
        let mut start = usize::from(pos);
        let mut stop = usize::from(end);
        while start < stop && self.present[start] {
            start += 1;
        }
        while stop > start && self.present[stop - 1] {
            stop -= 1;
        }
        if start == stop {
            return true;
        }

        if let Err(err) = host.read_config(bdf, start as u16, &mut self.data[start..stop]) {
            tracing::warn!(
                %bdf,
                pos = start,
                len = stop - start,
                error = &err as &dyn std::error::Error,
                "config fetch failed"
            );
            return false;
        }
        self.present[start..stop].fill(true);
        true
    }

    /// Doubles the cache capacity, preserving contents.
    fn grow(&mut self) {
        let new_len = self.data.len() * 2;
        let mut data = vec![0; new_len];
        let mut present = vec![false; new_len];
        data[..self.data.len()].copy_from_slice(&self.data);
        present[..self.present.len()].copy_from_slice(&self.present);
        self.data = data;
        self.present = present;
    }

    /// Gets the byte at `pos`.
    ///
    /// Panics if the byte was never fetched.
    pub fn get_byte(&self, pos: u16) -> u8 {
        assert!(
            self.is_present(pos),
            "config byte {pos:#x} requested before fetch"
        );
        self.data[usize::from(pos)]
    }

    /// Gets the little-endian 16-bit value at `pos`.
    pub fn get_word(&self, pos: u16) -> u16 {
        u16::from_le_bytes([self.get_byte(pos), self.get_byte(pos + 1)])
    }

    /// Gets the little-endian 32-bit value at `pos`.
    pub fn get_long(&self, pos: u16) -> u32 {
        u32::from_le_bytes([
            self.get_byte(pos),
            self.get_byte(pos + 1),
            self.get_byte(pos + 2),
            self.get_byte(pos + 3),
        ])
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

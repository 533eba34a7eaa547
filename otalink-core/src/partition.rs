// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Static partition table: named logical regions mapped onto one or more
//! flash devices, with bounds-checked relative addressing.
//!
//! The table is built once at start-up and is immutable afterwards; the
//! layout is a build-time contract between the bootloader and the
//! application. Every partition boundary must align to the erase granularity
//! of the device that backs it, and partitions on the same device must not
//! overlap.

use core::fmt;

use heapless::Vec;

use crate::flash::{FlashDevice, FlashError};

/// Maximum number of backing flash devices.
pub const MAX_DEVICES: usize = 4;
/// Maximum number of partitions in a table.
pub const MAX_PARTITIONS: usize = 8;

/// A named region of a flash device. Offsets are relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub name: &'static str,
    /// Index returned by [`PartitionTable::add_device`].
    pub device: usize,
    pub offset: u32,
    pub len: u32,
}

/// Errors detected while constructing the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum TableError {
    UnknownDevice(&'static str),
    /// Partition boundary not aligned to the backing device erase granularity.
    Misaligned(&'static str),
    /// Partition extends beyond the backing device.
    OutOfDevice(&'static str),
    /// Two partitions on the same device intersect.
    Overlap(&'static str, &'static str),
    DuplicateName(&'static str),
    Capacity,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::UnknownDevice(p) => write!(f, "partition {p}: unknown device index"),
            TableError::Misaligned(p) => write!(f, "partition {p}: boundary not erase-aligned"),
            TableError::OutOfDevice(p) => write!(f, "partition {p}: beyond device end"),
            TableError::Overlap(a, b) => write!(f, "partitions {a} and {b} overlap"),
            TableError::DuplicateName(p) => write!(f, "duplicate partition name {p}"),
            TableError::Capacity => f.write_str("table capacity exceeded"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TableError {}

/// Errors from partition-level storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum StorageError {
    Flash(FlashError),
    PartitionNotFound,
}

impl From<FlashError> for StorageError {
    fn from(e: FlashError) -> Self {
        StorageError::Flash(e)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Flash(e) => write!(f, "flash: {e}"),
            StorageError::PartitionNotFound => f.write_str("no such partition"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StorageError {}

/// Owns the flash devices for the process lifetime and routes partition-
/// relative operations to them.
pub struct PartitionTable<'d> {
    devices: Vec<&'d mut dyn FlashDevice, MAX_DEVICES>,
    partitions: Vec<Partition, MAX_PARTITIONS>,
}

impl<'d> PartitionTable<'d> {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            partitions: Vec::new(),
        }
    }

    /// Register a backing device; returns the index partitions refer to.
    pub fn add_device(&mut self, device: &'d mut dyn FlashDevice) -> Result<usize, TableError> {
        let index = self.devices.len();
        self.devices
            .push(device)
            .map_err(|_| TableError::Capacity)?;
        Ok(index)
    }

    /// Register a partition, validating alignment, bounds and overlap against
    /// everything added so far.
    pub fn add_partition(&mut self, part: Partition) -> Result<(), TableError> {
        let Some(device) = self.devices.get(part.device) else {
            return Err(TableError::UnknownDevice(part.name));
        };
        let block = device.erase_size();
        if part.offset % block != 0 || part.len % block != 0 {
            return Err(TableError::Misaligned(part.name));
        }
        let end = part
            .offset
            .checked_add(part.len)
            .ok_or(TableError::OutOfDevice(part.name))?;
        if end > device.size() {
            return Err(TableError::OutOfDevice(part.name));
        }
        for other in &self.partitions {
            if other.name == part.name {
                return Err(TableError::DuplicateName(part.name));
            }
            if other.device == part.device
                && part.offset < other.offset + other.len
                && other.offset < end
            {
                return Err(TableError::Overlap(other.name, part.name));
            }
        }
        self.partitions
            .push(part)
            .map_err(|_| TableError::Capacity)
    }

    pub fn find(&self, name: &str) -> Result<&Partition, StorageError> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .ok_or(StorageError::PartitionNotFound)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Program alignment of the device backing `name`.
    pub fn write_align(&self, name: &str) -> Result<u32, StorageError> {
        let part = *self.find(name)?;
        Ok(self.devices[part.device].write_size())
    }

    fn locate(&mut self, name: &str, rel: u32, len: u32) -> Result<(u32, usize), StorageError> {
        let part = *self.find(name)?;
        match rel.checked_add(len) {
            Some(end) if end <= part.len => Ok((part.offset + rel, part.device)),
            _ => Err(StorageError::Flash(FlashError::OutOfRange)),
        }
    }

    /// Bounds-checked read relative to the named partition.
    pub fn read(&mut self, name: &str, rel: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let (abs, dev) = self.locate(name, rel, buf.len() as u32)?;
        self.devices[dev].read(abs, buf).map_err(StorageError::from)
    }

    /// Bounds-checked, verified write relative to the named partition.
    pub fn write(&mut self, name: &str, rel: u32, data: &[u8]) -> Result<(), StorageError> {
        let (abs, dev) = self.locate(name, rel, data.len() as u32)?;
        self.devices[dev]
            .write(abs, data)
            .map_err(StorageError::from)
    }

    /// Erase the blocks covering `rel..rel+len` inside the named partition.
    /// Partition boundaries are erase-aligned, so the cover never leaks into
    /// a neighbouring partition.
    pub fn erase(&mut self, name: &str, rel: u32, len: u32) -> Result<(), StorageError> {
        let (abs, dev) = self.locate(name, rel, len)?;
        self.devices[dev].erase(abs, len).map_err(StorageError::from)
    }

    /// Erase an entire partition.
    pub fn erase_all(&mut self, name: &str) -> Result<(), StorageError> {
        let len = self.find(name)?.len;
        self.erase(name, 0, len)
    }
}

impl Default for PartitionTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}

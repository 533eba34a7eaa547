// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash device abstraction: bounds/alignment-checked read, write and erase
//! over device-specific raw operations.
//!
//! Back-ends implement the three `*_raw` hooks plus the geometry accessors;
//! everything callers are allowed to touch goes through the provided checked
//! methods. Writes are read back and compared immediately; a mismatch is a
//! hard error at this layer, retry policy belongs to the caller.

use core::fmt;

/// Read-back comparison chunk, also used for image copies.
pub const VERIFY_CHUNK: usize = 256;

/// Storage-level errors. All of these are fatal to the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The requested range extends beyond the device or partition end.
    OutOfRange,
    /// Write offset or length not aligned to the device program alignment.
    AlignmentViolation,
    /// The device reported a fault during program/erase.
    HardwareFault,
    /// Read-back after programming did not match the written data.
    VerifyMismatch,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FlashError::OutOfRange => "range beyond device end",
            FlashError::AlignmentViolation => "offset or length misaligned",
            FlashError::HardwareFault => "flash hardware fault",
            FlashError::VerifyMismatch => "write read-back mismatch",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlashError {}

fn check_range(size: u32, offset: u32, len: u32) -> Result<(), FlashError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(FlashError::OutOfRange),
    }
}

/// A contiguous byte-addressable flash region.
///
/// `read_raw`/`program_raw`/`erase_raw` receive ranges that are already
/// bounds-checked (and, for erase, block-aligned and bank-local).
pub trait FlashDevice {
    fn name(&self) -> &'static str;

    /// Total device size in bytes. Expected to be a multiple of `erase_size`.
    fn size(&self) -> u32;

    /// Smallest erasable block in bytes.
    fn erase_size(&self) -> u32;

    /// Program alignment in bytes.
    fn write_size(&self) -> u32;

    /// Internal bank size for multi-bank devices whose erase commands cannot
    /// cross a bank boundary. `None` for single-bank devices.
    fn bank_size(&self) -> Option<u32> {
        None
    }

    fn read_raw(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn program_raw(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
    fn erase_raw(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Bounds-checked read.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_range(self.size(), offset, buf.len() as u32)?;
        self.read_raw(offset, buf)
    }

    /// Bounds- and alignment-checked program with read-back verification.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        check_range(self.size(), offset, data.len() as u32)?;
        let align = self.write_size();
        if offset % align != 0 || data.len() as u32 % align != 0 {
            return Err(FlashError::AlignmentViolation);
        }
        self.program_raw(offset, data)?;

        let mut chunk = [0u8; VERIFY_CHUNK];
        for (i, expected) in data.chunks(VERIFY_CHUNK).enumerate() {
            let at = offset + (i * VERIFY_CHUNK) as u32;
            self.read_raw(at, &mut chunk[..expected.len()])?;
            if &chunk[..expected.len()] != expected {
                return Err(FlashError::VerifyMismatch);
            }
        }
        Ok(())
    }

    /// Erase every erase-granularity block intersecting `offset..offset+len`
    /// and no more. Ranges crossing an internal bank boundary are split into
    /// bank-scoped erases.
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_range(self.size(), offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let block = self.erase_size();
        let start = offset - offset % block;
        let end = (offset + len).div_ceil(block) * block;

        match self.bank_size() {
            Some(bank) => {
                let mut at = start;
                while at < end {
                    let bank_end = (at / bank + 1) * bank;
                    let stop = bank_end.min(end);
                    self.erase_raw(at, stop - at)?;
                    at = stop;
                }
                Ok(())
            }
            None => self.erase_raw(start, end - start),
        }
    }
}

/// In-memory NOR-like flash simulator.
///
/// Erase sets bytes to 0xFF; programming can only clear bits, so writes over
/// un-erased data show up as a read-back mismatch just like real hardware.
/// Used by the test suite and by host-side demos.
pub struct MemFlash<const SIZE: usize> {
    name: &'static str,
    erase_size: u32,
    write_size: u32,
    bank_size: Option<u32>,
    mem: [u8; SIZE],
    /// Number of successful program operations, for write-count assertions.
    pub program_ops: usize,
    /// Number of raw erase operations (post bank splitting).
    pub erase_ops: usize,
    /// When set, the next program operation fails with `HardwareFault`.
    pub fail_next_program: bool,
}

impl<const SIZE: usize> MemFlash<SIZE> {
    pub fn new(name: &'static str, erase_size: u32, write_size: u32) -> Self {
        Self {
            name,
            erase_size,
            write_size,
            bank_size: None,
            mem: [0xFF; SIZE],
            program_ops: 0,
            erase_ops: 0,
            fail_next_program: false,
        }
    }

    pub fn with_bank_size(mut self, bank_size: u32) -> Self {
        self.bank_size = Some(bank_size);
        self
    }

    pub fn contents(&self) -> &[u8] {
        &self.mem
    }
}

impl<const SIZE: usize> FlashDevice for MemFlash<SIZE> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn size(&self) -> u32 {
        SIZE as u32
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn write_size(&self) -> u32 {
        self.write_size
    }

    fn bank_size(&self) -> Option<u32> {
        self.bank_size
    }

    fn read_raw(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let at = offset as usize;
        buf.copy_from_slice(&self.mem[at..at + buf.len()]);
        Ok(())
    }

    fn program_raw(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_next_program {
            self.fail_next_program = false;
            return Err(FlashError::HardwareFault);
        }
        let at = offset as usize;
        for (cell, byte) in self.mem[at..at + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.program_ops += 1;
        Ok(())
    }

    fn erase_raw(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        let at = offset as usize;
        self.mem[at..at + len as usize].fill(0xFF);
        self.erase_ops += 1;
        Ok(())
    }
}

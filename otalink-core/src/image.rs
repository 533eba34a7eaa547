// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware image header and whole-image validation.
//!
//! Every image stored in a partition starts with a fixed 32-byte header:
//! magic marker, version, payload length, payload CRC-32 and flags. The
//! byte layout is little-endian and is a build-time contract between the
//! packaging tooling and the bootloader.

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::partition::{PartitionTable, StorageError};

pub const IMAGE_MAGIC: u32 = 0x4F54_4131; // "OTA1"
pub const HEADER_LEN: usize = 32;

/// Header flag: payload arrives encrypted and must pass the [`Decryptor`].
pub const FLAG_ENCRYPTED: u32 = 1 << 0;

/// CRC used for firmware payload integrity.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Fixed-size image header (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub version: u32,
    pub payload_len: u32,
    pub payload_crc: u32,
    pub flags: u32,
    _reserved: [u32; 3],
}

// Compile-time size check
const _: () = assert!(core::mem::size_of::<ImageHeader>() == HEADER_LEN);

impl ImageHeader {
    pub fn new(version: u32, payload_len: u32, payload_crc: u32, flags: u32) -> Self {
        Self {
            magic: IMAGE_MAGIC,
            version,
            payload_len,
            payload_crc,
            flags,
            _reserved: [0; 3],
        }
    }

    /// Serialize to the on-flash little-endian layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_crc.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Parse from the on-flash layout. Returns `None` if `buf` is short;
    /// the magic is *not* checked here, see [`ImageHeader::is_valid_magic`].
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Some(Self {
            magic: word(0),
            version: word(4),
            payload_len: word(8),
            payload_crc: word(12),
            flags: word(16),
            _reserved: [0; 3],
        })
    }

    pub fn is_valid_magic(&self) -> bool {
        self.magic == IMAGE_MAGIC
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

/// Result of inspecting a partition as a firmware package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum ImageState {
    /// Header area is erased flash; no image present.
    Empty,
    /// Header or payload failed validation.
    Invalid,
    Valid { version: u32, payload_len: u32 },
}

/// Validate the image stored in `name` as a unit: magic, declared length
/// against the partition, and payload CRC-32.
pub fn inspect(table: &mut PartitionTable<'_>, name: &str) -> Result<ImageState, StorageError> {
    let mut raw = [0u8; HEADER_LEN];
    table.read(name, 0, &mut raw)?;
    if raw.iter().all(|&b| b == 0xFF) {
        return Ok(ImageState::Empty);
    }
    // 32 bytes were read, parse cannot fail.
    let header = match ImageHeader::parse(&raw) {
        Some(h) => h,
        None => return Ok(ImageState::Invalid),
    };
    if !header.is_valid_magic() {
        return Ok(ImageState::Invalid);
    }
    let part_len = table.find(name)?.len;
    if part_len < HEADER_LEN as u32 || header.payload_len > part_len - HEADER_LEN as u32 {
        return Ok(ImageState::Invalid);
    }

    let mut digest = CRC32.digest();
    let mut chunk = [0u8; 256];
    let mut remaining = header.payload_len;
    let mut at = HEADER_LEN as u32;
    while remaining > 0 {
        let n = (remaining as usize).min(chunk.len());
        table.read(name, at, &mut chunk[..n])?;
        digest.update(&chunk[..n]);
        at += n as u32;
        remaining -= n as u32;
    }
    if digest.finalize() == header.payload_crc {
        Ok(ImageState::Valid {
            version: header.version,
            payload_len: header.payload_len,
        })
    } else {
        Ok(ImageState::Invalid)
    }
}

/// Opaque streaming decryption primitive. Internals (cipher, key, IV
/// schedule) are supplied by the integrator; the engine only routes
/// post-header payload bytes through it in arrival order.
pub trait Decryptor {
    fn decrypt(&mut self, buf: &mut [u8]);
}

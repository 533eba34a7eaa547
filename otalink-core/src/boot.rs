// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Persisted boot-request sentinel shared between bootloader and application.
//!
//! A 64-bit cell at a fixed RAM address survives a reset (but not power
//! loss) and carries the application's request to the bootloader. The
//! address and the magic constants below must be identical in both images;
//! reading and writing the cell itself is board glue and stays outside this
//! crate.

/// Fixed address of the sentinel cell. Board contract; must sit in RAM that
/// neither image zeroes during startup.
pub const BOOT_REQUEST_ADDR: u32 = 0x2003_BFF0;

pub const BOOT_REQUEST_NORMAL: u64 = 0x0FDA_7E00_4E4F_524D; // "NORM"
pub const BOOT_REQUEST_UPDATE: u64 = 0x0FDA_7E00_5550_4454; // "UPDT"
pub const BOOT_REQUEST_RECOVERY: u64 = 0x0FDA_7E00_5245_4356; // "RECV"
/// Watchdog-safe bootloader-only reset: stay in the loader, touch nothing.
pub const BOOT_REQUEST_STAY_IN_LOADER: u64 = 0x0FDA_7E00_424F_4F54; // "BOOT"

/// Classified boot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum BootRequest {
    Normal,
    Update,
    Recovery,
    StayInLoader,
}

impl BootRequest {
    /// Classify the raw sentinel value. Anything unrecognized (power-on
    /// garbage included) is a normal boot.
    pub fn classify(raw: u64) -> Self {
        match raw {
            BOOT_REQUEST_UPDATE => BootRequest::Update,
            BOOT_REQUEST_RECOVERY => BootRequest::Recovery,
            BOOT_REQUEST_STAY_IN_LOADER => BootRequest::StayInLoader,
            _ => BootRequest::Normal,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            BootRequest::Normal => BOOT_REQUEST_NORMAL,
            BootRequest::Update => BOOT_REQUEST_UPDATE,
            BootRequest::Recovery => BOOT_REQUEST_RECOVERY,
            BootRequest::StayInLoader => BOOT_REQUEST_STAY_IN_LOADER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_roundtrip() {
        for request in [
            BootRequest::Normal,
            BootRequest::Update,
            BootRequest::Recovery,
            BootRequest::StayInLoader,
        ] {
            assert_eq!(BootRequest::classify(request.raw()), request);
        }
    }

    #[test]
    fn test_garbage_is_normal_boot() {
        assert_eq!(BootRequest::classify(0), BootRequest::Normal);
        assert_eq!(BootRequest::classify(u64::MAX), BootRequest::Normal);
        assert_eq!(BootRequest::classify(0xDEAD_BEEF), BootRequest::Normal);
    }

    #[test]
    fn test_magics_are_distinct() {
        let magics = [
            BOOT_REQUEST_NORMAL,
            BOOT_REQUEST_UPDATE,
            BOOT_REQUEST_RECOVERY,
            BOOT_REQUEST_STAY_IN_LOADER,
        ];
        for (i, a) in magics.iter().enumerate() {
            for b in &magics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}

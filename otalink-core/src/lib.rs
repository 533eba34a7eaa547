// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Transport-agnostic firmware update engine for bootloader-resident use.
//!
//! otalink receives a firmware image over a serial-style transport, stores it
//! into a staging flash partition, and decides on every boot which image to
//! run next. The engine never touches hardware directly: flash enters through
//! the [`flash::FlashDevice`] trait, the transport through
//! [`protocol::FramePort`], and decryption through [`image::Decryptor`].
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std` mode for embedded targets
//! - `std` feature: Enables `std::error::Error` impls for host tools
//! - `use-defmt` / `use-log` features: select a logging back-end

#![cfg_attr(not(feature = "std"), no_std)]

pub mod boot;
pub mod config;
pub mod flash;
pub mod image;
pub mod partition;
pub mod protocol;
pub mod timer;
pub mod update;

// Re-export commonly used types
pub use boot::BootRequest;
pub use config::{
    ConfigError, NoFirmwarePolicy, PartitionScheme, SafetyCheck, UpdateConfig, VersionPolicy,
};
pub use flash::{FlashDevice, FlashError, MemFlash};
pub use image::{Decryptor, ImageHeader, ImageState, HEADER_LEN, IMAGE_MAGIC};
pub use partition::{Partition, PartitionTable, StorageError, TableError};
pub use protocol::{
    Deframer, FlowState, FrameOutcome, FramePort, PayloadSink, ReplyInfo, TransferSession, ACK,
    CAN, EOT, NAK, POLL, SOH, STX,
};
pub use timer::{TimerHandle, TimerPool};
pub use update::{
    BootOutcome, BootReport, ImageWriter, TransferVerdict, UpdateError, UpdateOrchestrator,
    UpdateStatus,
};

#[cfg(feature = "use-defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "use-log", not(feature = "use-defmt")))]
pub(crate) use logger_crate as log;

#[cfg(not(any(feature = "use-log", feature = "use-defmt")))]
pub(crate) mod log {
    macro_rules! info {
        ( $( $x:expr ),* $(,)? ) => {};
    }
    pub(crate) use info;
    macro_rules! warner {
        ( $( $x:expr ),* $(,)? ) => {};
    }
    pub(crate) use warner as warn;
}

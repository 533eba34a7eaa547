// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Update engine configuration.
//!
//! All policy choices live in one explicit struct, validated once against the
//! partition table at start-up. Every decision branch in the orchestrator
//! reads these fields, so every policy combination is testable at runtime.

use core::fmt;

use crate::partition::PartitionTable;

/// How many partitions participate in the update scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum PartitionScheme {
    /// Single partition; transfers write the active image directly.
    ActiveOnly,
    /// Active + staging.
    ActiveStaging,
    /// Active + staging + factory fallback.
    ActiveStagingFactory,
}

/// Boot-time validation policy for the active partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum SafetyCheck {
    /// Skip validation entirely.
    DoNotCheck,
    /// Require validity only when staging or factory could restore the
    /// active image; with nothing to restore from, boot it unverified
    /// rather than deadlock.
    CheckUnlessEmpty,
    /// Any invalidity is fatal to boot until corrected from staging or
    /// factory.
    AutoUpdateApp,
    /// Leave an invalid active image in place and do not jump to it.
    DoNotDoAnything,
}

/// What to do when no runnable image exists anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum NoFirmwarePolicy {
    /// Attempt to run whatever is present anyway.
    JumpToApp,
    /// Stay in the receive loop until a new image arrives.
    WaitForNewFirmware,
}

/// How the reference version for "is this staged image new" is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum VersionPolicy {
    /// Compare the staged header version against the header already in the
    /// active partition; equal versions are not re-applied.
    CompareHeaders,
    /// Erase staging after a successful copy; the reference version is then
    /// implicitly "none" and any valid staged image applies.
    EraseStagingAfterApply,
}

/// Complete build-time configuration of the update engine.
#[derive(Debug, Clone, Copy)]
pub struct UpdateConfig {
    pub scheme: PartitionScheme,
    pub active: &'static str,
    pub staging: &'static str,
    pub factory: &'static str,
    /// Apply a valid, version-differing staged image on normal boot, without
    /// requiring the boot-request sentinel.
    pub auto_update: bool,
    pub safety_check: SafetyCheck,
    pub no_firmware: NoFirmwarePolicy,
    pub version_policy: VersionPolicy,
    /// Remap transfer destinations that are not legal for the scheme to the
    /// staging partition instead of rejecting the transfer.
    pub auto_correct_destination: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A partition the scheme requires is missing from the table.
    MissingPartition(&'static str),
    /// Two roles resolve to the same partition.
    AliasedPartitions(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingPartition(p) => write!(f, "required partition {p} not in table"),
            ConfigError::AliasedPartitions(p) => write!(f, "partition {p} assigned to two roles"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

impl UpdateConfig {
    /// Defaults for a scheme: conservative checks, wait when empty, header
    /// version comparison, destination auto-correction on.
    pub fn new(scheme: PartitionScheme) -> Self {
        Self {
            scheme,
            active: "active",
            staging: "staging",
            factory: "factory",
            auto_update: false,
            safety_check: SafetyCheck::CheckUnlessEmpty,
            no_firmware: NoFirmwarePolicy::WaitForNewFirmware,
            version_policy: VersionPolicy::CompareHeaders,
            auto_correct_destination: true,
        }
    }

    pub fn has_staging(&self) -> bool {
        !matches!(self.scheme, PartitionScheme::ActiveOnly)
    }

    pub fn has_factory(&self) -> bool {
        matches!(self.scheme, PartitionScheme::ActiveStagingFactory)
    }

    /// Check the configuration against the partition table, once, at
    /// start-up.
    pub fn validate(&self, table: &PartitionTable<'_>) -> Result<(), ConfigError> {
        let mut required = [Some(self.active), None, None];
        if self.has_staging() {
            required[1] = Some(self.staging);
        }
        if self.has_factory() {
            required[2] = Some(self.factory);
        }
        for name in required.into_iter().flatten() {
            if table.find(name).is_err() {
                return Err(ConfigError::MissingPartition(name));
            }
        }
        if self.has_staging() && self.active == self.staging {
            return Err(ConfigError::AliasedPartitions(self.active));
        }
        if self.has_factory() && (self.factory == self.active || self.factory == self.staging) {
            return Err(ConfigError::AliasedPartitions(self.factory));
        }
        Ok(())
    }
}

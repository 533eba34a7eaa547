// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Update decision engine.
//!
//! On every boot the orchestrator re-evaluates partition state and decides
//! whether to apply a staged image, recover from factory, boot the active
//! image, or wait for a new transfer. At the end of a transfer it validates
//! the received image as a unit and reports a verdict.
//!
//! Copy-then-switch discipline throughout: the active partition is only
//! erased after its replacement source has been fully validated, so a
//! storage error mid-update can never brick a device that had a valid
//! active image.

use core::fmt;

use crate::config::{ConfigError, NoFirmwarePolicy, SafetyCheck, UpdateConfig, VersionPolicy};
use crate::flash::{FlashError, VERIFY_CHUNK};
use crate::image::{self, Decryptor, ImageHeader, ImageState, HEADER_LEN};
use crate::log;
use crate::partition::{PartitionTable, StorageError};
use crate::protocol::{PayloadSink, ReplyInfo, STX_PAYLOAD};

/// Reasons an update step was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum UpdateError {
    Storage(StorageError),
    /// The named partition does not hold a valid image.
    InvalidImage(&'static str),
    /// Transfer destination rejected for the current scheme.
    DestinationNotAllowed,
    /// Image does not fit the destination partition.
    ImageTooLarge,
    /// Malformed transfer metadata block.
    BadMetadata,
    /// Image is marked encrypted but no decryptor was supplied.
    MissingDecryptor,
    /// No valid image exists anywhere to recover from.
    NoUsableImage,
}

impl From<StorageError> for UpdateError {
    fn from(e: StorageError) -> Self {
        UpdateError::Storage(e)
    }
}

impl From<FlashError> for UpdateError {
    fn from(e: FlashError) -> Self {
        UpdateError::Storage(StorageError::Flash(e))
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Storage(e) => write!(f, "storage: {e}"),
            UpdateError::InvalidImage(p) => write!(f, "no valid image in {p}"),
            UpdateError::DestinationNotAllowed => f.write_str("destination not allowed"),
            UpdateError::ImageTooLarge => f.write_str("image exceeds destination partition"),
            UpdateError::BadMetadata => f.write_str("malformed transfer metadata"),
            UpdateError::MissingDecryptor => f.write_str("encrypted image without decryptor"),
            UpdateError::NoUsableImage => f.write_str("no usable image found"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UpdateError {}

/// What happened to a pending update during boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum UpdateStatus {
    NotRequested,
    /// Nothing to apply: staging empty or version already running.
    NotNeeded,
    Applied { version: u32 },
    /// Factory image restored into the active partition.
    Recovered,
    Failed(UpdateError),
}

/// Where the boot sequence ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum BootOutcome {
    /// Jump to the active partition. `version` is `None` when the image was
    /// not (or could not be) validated.
    RunActive { version: Option<u32> },
    /// Remain in the bootloader receive loop.
    WaitForFirmware,
}

/// Complete result of one boot evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub outcome: BootOutcome,
    pub update: UpdateStatus,
}

/// Verdict on a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerdict {
    Accepted { version: u32 },
    Rejected(UpdateError),
}

/// Treat unreadable partitions as invalid for decision purposes.
fn state_of(table: &mut PartitionTable<'_>, name: &str) -> ImageState {
    match image::inspect(table, name) {
        Ok(state) => state,
        Err(_) => {
            log::warn!("partition unreadable during inspection");
            ImageState::Invalid
        }
    }
}

/// The decision engine. Holds the validated configuration; all persistent
/// state lives in flash.
pub struct UpdateOrchestrator {
    cfg: UpdateConfig,
}

impl UpdateOrchestrator {
    pub fn new(cfg: UpdateConfig, table: &PartitionTable<'_>) -> Result<Self, ConfigError> {
        cfg.validate(table)?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.cfg
    }

    /// Boot-time decision, evaluated once per boot. Never panics the boot:
    /// a failed update step is reported in the returned status while the
    /// safety check still decides what to run.
    pub fn boot(
        &self,
        table: &mut PartitionTable<'_>,
        request: crate::boot::BootRequest,
    ) -> BootReport {
        use crate::boot::BootRequest;

        if request == BootRequest::StayInLoader {
            return BootReport {
                outcome: BootOutcome::WaitForFirmware,
                update: UpdateStatus::NotRequested,
            };
        }

        let update = match request {
            BootRequest::Update => {
                if self.cfg.has_staging() {
                    self.apply_staged(table, true)
                } else {
                    // Single-partition scheme: the transfer already wrote the
                    // active image directly.
                    UpdateStatus::NotNeeded
                }
            }
            BootRequest::Recovery => {
                if self.cfg.has_factory() {
                    match self.restore(table, self.cfg.factory) {
                        Ok(()) => UpdateStatus::Recovered,
                        Err(e) => UpdateStatus::Failed(e),
                    }
                } else {
                    UpdateStatus::Failed(UpdateError::NoUsableImage)
                }
            }
            BootRequest::Normal if self.cfg.auto_update && self.cfg.has_staging() => {
                self.apply_staged(table, false)
            }
            _ => UpdateStatus::NotRequested,
        };

        let outcome = self.safety_check(table);
        BootReport { outcome, update }
    }

    /// Apply the staged image if it is valid and new. `explicit` marks an
    /// update that was requested through the sentinel, where a corrupt
    /// staged image is an error rather than a no-op.
    fn apply_staged(&self, table: &mut PartitionTable<'_>, explicit: bool) -> UpdateStatus {
        let staging = self.cfg.staging;
        match state_of(table, staging) {
            ImageState::Empty => UpdateStatus::NotNeeded,
            ImageState::Invalid => {
                if explicit {
                    UpdateStatus::Failed(UpdateError::InvalidImage(staging))
                } else {
                    UpdateStatus::NotNeeded
                }
            }
            ImageState::Valid {
                version,
                payload_len,
            } => {
                if self.cfg.version_policy == VersionPolicy::CompareHeaders {
                    if let ImageState::Valid {
                        version: running, ..
                    } = state_of(table, self.cfg.active)
                    {
                        if running == version {
                            return UpdateStatus::NotNeeded;
                        }
                    }
                }
                match self.promote(table, staging, payload_len) {
                    Ok(()) => {
                        log::info!("staged image applied, version {}", version);
                        UpdateStatus::Applied { version }
                    }
                    Err(e) => UpdateStatus::Failed(e),
                }
            }
        }
    }

    /// Copy a fully validated image from `src` into the active partition
    /// and re-validate the result, then retire staging per version policy.
    fn promote(
        &self,
        table: &mut PartitionTable<'_>,
        src: &'static str,
        payload_len: u32,
    ) -> Result<(), UpdateError> {
        self.copy_image(table, src, self.cfg.active, HEADER_LEN as u32 + payload_len)?;
        match state_of(table, self.cfg.active) {
            ImageState::Valid { .. } => {}
            _ => return Err(UpdateError::InvalidImage(self.cfg.active)),
        }
        if src == self.cfg.staging
            && self.cfg.version_policy == VersionPolicy::EraseStagingAfterApply
        {
            table.erase_all(self.cfg.staging)?;
        }
        Ok(())
    }

    /// Restore a source image (factory or staging) into the active
    /// partition, requiring the source to be valid first.
    fn restore(&self, table: &mut PartitionTable<'_>, src: &'static str) -> Result<(), UpdateError> {
        match state_of(table, src) {
            ImageState::Valid { payload_len, .. } => self.promote(table, src, payload_len),
            _ => Err(UpdateError::NoUsableImage),
        }
    }

    /// Block-wise erase + copy + per-block read-back through the flash
    /// write path. The destination is erased here, after the caller has
    /// validated the source.
    fn copy_image(
        &self,
        table: &mut PartitionTable<'_>,
        src: &str,
        dst: &str,
        total: u32,
    ) -> Result<(), UpdateError> {
        let dst_len = table.find(dst)?.len;
        if total > dst_len {
            return Err(UpdateError::ImageTooLarge);
        }
        table.erase(dst, 0, total)?;

        let align = table.write_align(dst)?;
        let end = total.div_ceil(align) * align;
        let mut chunk = [0u8; VERIFY_CHUNK];
        let mut at = 0u32;
        while at < end {
            let n = ((end - at) as usize).min(VERIFY_CHUNK);
            table.read(src, at, &mut chunk[..n])?;
            table.write(dst, at, &chunk[..n])?;
            at += n as u32;
        }
        Ok(())
    }

    /// Validate (and if policy allows, repair) the active partition, then
    /// decide where boot ends up.
    fn safety_check(&self, table: &mut PartitionTable<'_>) -> BootOutcome {
        if self.cfg.safety_check == SafetyCheck::DoNotCheck {
            return BootOutcome::RunActive { version: None };
        }

        let active = state_of(table, self.cfg.active);
        if let ImageState::Valid { version, .. } = active {
            return BootOutcome::RunActive {
                version: Some(version),
            };
        }

        match self.cfg.safety_check {
            SafetyCheck::DoNotDoAnything => {
                // Leave the invalid image in place, do not jump to it.
                self.no_firmware_outcome()
            }
            SafetyCheck::CheckUnlessEmpty => {
                let staging_empty = !self.cfg.has_staging()
                    || state_of(table, self.cfg.staging) == ImageState::Empty;
                let factory_empty = !self.cfg.has_factory()
                    || state_of(table, self.cfg.factory) == ImageState::Empty;
                if staging_empty && factory_empty {
                    // Nothing exists to re-validate against: boot the
                    // unverifiable-but-possibly-fine image rather than
                    // deadlock, unless there is no image at all.
                    if active == ImageState::Empty {
                        return self.no_firmware_outcome();
                    }
                    return BootOutcome::RunActive { version: None };
                }
                self.repair(table)
                    .unwrap_or_else(|| self.no_firmware_outcome())
            }
            // DoNotCheck already returned above; AutoUpdateApp repairs or
            // halts.
            _ => self
                .repair(table)
                .unwrap_or_else(|| self.no_firmware_outcome()),
        }
    }

    /// Correct an unusable active image from staging, then factory.
    fn repair(&self, table: &mut PartitionTable<'_>) -> Option<BootOutcome> {
        let sources = [
            self.cfg.has_staging().then_some(self.cfg.staging),
            self.cfg.has_factory().then_some(self.cfg.factory),
        ];
        for src in sources.into_iter().flatten() {
            if let ImageState::Valid { version, .. } = state_of(table, src) {
                match self.restore(table, src) {
                    Ok(()) => {
                        log::info!("active image restored, version {}", version);
                        return Some(BootOutcome::RunActive {
                            version: Some(version),
                        });
                    }
                    Err(_) => continue,
                }
            }
        }
        None
    }

    fn no_firmware_outcome(&self) -> BootOutcome {
        match self.cfg.no_firmware {
            NoFirmwarePolicy::JumpToApp => BootOutcome::RunActive { version: None },
            NoFirmwarePolicy::WaitForNewFirmware => BootOutcome::WaitForFirmware,
        }
    }

    /// Map a sender-requested destination onto a partition that is legal
    /// for the configured scheme. The active partition is never a legal
    /// transfer destination in a multi-partition scheme; with
    /// auto-correction enabled illegal destinations (unknown names
    /// included) are remapped to staging, otherwise the transfer is
    /// rejected. The factory partition is never writable over the wire.
    pub fn resolve_destination(&self, requested: &str) -> Result<&'static str, UpdateError> {
        if !self.cfg.has_staging() {
            // Single-partition scheme: active is the only destination.
            if requested == self.cfg.active || self.cfg.auto_correct_destination {
                return Ok(self.cfg.active);
            }
            return Err(UpdateError::DestinationNotAllowed);
        }
        if requested == self.cfg.staging {
            return Ok(self.cfg.staging);
        }
        if self.cfg.has_factory() && requested == self.cfg.factory {
            return Err(UpdateError::DestinationNotAllowed);
        }
        if self.cfg.auto_correct_destination {
            log::warn!("transfer destination remapped to staging");
            return Ok(self.cfg.staging);
        }
        Err(UpdateError::DestinationNotAllowed)
    }

    /// Validate the received image as a unit once the session reports
    /// success.
    pub fn finish_transfer(
        &self,
        table: &mut PartitionTable<'_>,
        dest: &'static str,
    ) -> TransferVerdict {
        match image::inspect(table, dest) {
            Ok(ImageState::Valid { version, .. }) => TransferVerdict::Accepted { version },
            Ok(_) => TransferVerdict::Rejected(UpdateError::InvalidImage(dest)),
            Err(e) => TransferVerdict::Rejected(e.into()),
        }
    }
}

// --- Transfer payload consumer ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    /// Waiting for the metadata block naming destination and length.
    AwaitMeta,
    Writing,
    Aborted,
}

/// Streams accepted transfer payloads into a flash partition.
///
/// The first payload of each file is a metadata block: NUL-terminated
/// destination partition name followed by the image length in ASCII
/// decimal. An empty name terminates a multi-file batch. Subsequent
/// payloads are raw image bytes (header first); post-header bytes are
/// routed through the decryptor when the header carries the encrypted
/// flag.
pub struct ImageWriter<'a, 'd> {
    table: &'a mut PartitionTable<'d>,
    orchestrator: &'a UpdateOrchestrator,
    decryptor: Option<&'a mut dyn Decryptor>,
    state: WriterState,
    dest: Option<&'static str>,
    /// Image length announced in the metadata block; 0 when unknown.
    announced: u32,
    written: u32,
    header: Option<ImageHeader>,
    reply: ReplyInfo,
    error: Option<UpdateError>,
    batch_done: bool,
    buf: [u8; STX_PAYLOAD],
}

impl<'a, 'd> ImageWriter<'a, 'd> {
    pub fn new(
        table: &'a mut PartitionTable<'d>,
        orchestrator: &'a UpdateOrchestrator,
        decryptor: Option<&'a mut dyn Decryptor>,
    ) -> Self {
        Self {
            table,
            orchestrator,
            decryptor,
            state: WriterState::AwaitMeta,
            dest: None,
            announced: 0,
            written: 0,
            header: None,
            reply: ReplyInfo::Pending,
            error: None,
            batch_done: false,
            buf: [0; STX_PAYLOAD],
        }
    }

    pub fn destination(&self) -> Option<&'static str> {
        self.dest
    }

    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    pub fn last_error(&self) -> Option<UpdateError> {
        self.error
    }

    pub fn is_batch_done(&self) -> bool {
        self.batch_done
    }

    /// Rearm for the next file of a batch. Files with an announced length
    /// complete on their own once that many bytes are written; this is for
    /// unannounced-length transfers, whose end only the terminator
    /// handshake defines.
    pub fn end_file(&mut self) {
        if self.state == WriterState::Writing {
            self.state = WriterState::AwaitMeta;
        }
    }

    fn step(&mut self, payload: &[u8]) -> Result<ReplyInfo, UpdateError> {
        match self.state {
            WriterState::Aborted => Ok(ReplyInfo::Cancelled),
            WriterState::AwaitMeta => self.begin_file(payload),
            WriterState::Writing => self.write_block(payload),
        }
    }

    fn begin_file(&mut self, payload: &[u8]) -> Result<ReplyInfo, UpdateError> {
        if payload.first() == Some(&0) {
            // Empty name: end of batch.
            self.batch_done = true;
            return Ok(ReplyInfo::Ok);
        }
        let (name, announced) = parse_metadata(payload).ok_or(UpdateError::BadMetadata)?;
        let dest = self.orchestrator.resolve_destination(name)?;
        let part_len = self.table.find(dest)?.len;
        if announced > part_len {
            return Err(UpdateError::ImageTooLarge);
        }
        // Padded frames can write up to one frame past the announced
        // length; on devices whose erase granularity is smaller than a
        // frame the tail would otherwise land in un-erased flash. Erase a
        // whole number of frames.
        let cover = if announced > 0 {
            (announced.div_ceil(STX_PAYLOAD as u32) * STX_PAYLOAD as u32).min(part_len)
        } else {
            part_len
        };
        self.table.erase(dest, 0, cover)?;

        self.dest = Some(dest);
        self.announced = announced;
        self.written = 0;
        self.header = None;
        self.state = WriterState::Writing;
        log::info!("incoming image, {} bytes announced", announced);
        Ok(ReplyInfo::Ok)
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<ReplyInfo, UpdateError> {
        let Some(dest) = self.dest else {
            return Err(UpdateError::BadMetadata);
        };
        let n = payload.len();
        self.buf[..n].copy_from_slice(payload);

        // The image header rides at the front of the first block, in the
        // clear, and decides whether the rest of the stream is decrypted.
        if self.written == 0 {
            if let Some(header) = ImageHeader::parse(payload) {
                if header.is_valid_magic() {
                    if header.is_encrypted() && self.decryptor.is_none() {
                        return Err(UpdateError::MissingDecryptor);
                    }
                    self.header = Some(header);
                }
            }
        }
        if let Some(header) = &self.header {
            if header.is_encrypted() {
                let skip = (HEADER_LEN as u32).saturating_sub(self.written) as usize;
                if skip < n {
                    if let Some(decryptor) = self.decryptor.as_mut() {
                        decryptor.decrypt(&mut self.buf[skip..n]);
                    }
                }
            }
        }

        let part_len = self.table.find(dest)?.len;
        if self.written + n as u32 > part_len {
            return Err(UpdateError::ImageTooLarge);
        }

        match self.table.write(dest, self.written, &self.buf[..n]) {
            Ok(()) => {
                self.written += n as u32;
                if self.announced > 0 && self.written >= self.announced {
                    // File complete: the next block is metadata again, so a
                    // batch-end block can never be consumed as padding.
                    self.state = WriterState::AwaitMeta;
                }
                Ok(ReplyInfo::Ok)
            }
            // One retransmission chance through the protocol; everything
            // else aborts the transfer.
            Err(StorageError::Flash(FlashError::VerifyMismatch)) => Ok(ReplyInfo::Failed),
            Err(e) => Err(e.into()),
        }
    }
}

impl PayloadSink for ImageWriter<'_, '_> {
    fn prepare(&mut self, payload: &[u8]) {
        self.reply = match self.step(payload) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("transfer aborted: update step failed");
                self.error = Some(e);
                self.state = WriterState::Aborted;
                ReplyInfo::Cancelled
            }
        };
    }

    fn poll_reply(&mut self) -> ReplyInfo {
        self.reply
    }
}

/// Metadata block: `name NUL length-in-ascii-decimal [NUL ...]`.
fn parse_metadata(payload: &[u8]) -> Option<(&str, u32)> {
    let nul = payload.iter().position(|&b| b == 0)?;
    let name = core::str::from_utf8(&payload[..nul]).ok()?;
    let mut length: u32 = 0;
    let mut saw_digit = false;
    for &b in &payload[nul + 1..] {
        if b.is_ascii_digit() {
            length = length.checked_mul(10)?.checked_add((b - b'0') as u32)?;
            saw_digit = true;
        } else {
            break;
        }
    }
    if !saw_digit {
        length = 0;
    }
    Some((name, length))
}

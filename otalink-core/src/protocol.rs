// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Packet-oriented receive state machine for the firmware transfer link.
//!
//! One frame is one event: marker byte, sequence byte, one's-complement
//! sequence byte, fixed-size payload and a trailing CRC-16 (XMODEM
//! polynomial). `StartOfHeader` (0x01) frames carry 128 payload bytes,
//! `StartOfText` (0x02) frames carry 1024; `EndOfTransfer` and `Cancel` are
//! single bytes. The protocol requires two consecutive end markers before a
//! transfer is accepted, and a poll byte is emitted on a timer while the
//! receiver is waiting for the sender.
//!
//! Frame acceptance is decoupled from payload consumption: an accepted
//! payload is handed to the [`PayloadSink`] and the positive acknowledgment
//! is deferred until the sink reports back through [`PayloadSink::poll_reply`].

use crc::{Crc, CRC_16_XMODEM};

use crate::log;
use crate::timer::{TimerHandle, TimerPool};

// --- Wire constants ---

/// Marker of a 128-byte data frame.
pub const SOH: u8 = 0x01;
/// Marker of a 1024-byte data frame.
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
/// Poll byte emitted while waiting for the sender ('C').
pub const POLL: u8 = 0x43;

pub const SOH_PAYLOAD: usize = 128;
pub const STX_PAYLOAD: usize = 1024;
/// Marker + sequence + complement + 2 CRC bytes.
pub const FRAME_OVERHEAD: usize = 5;
pub const MAX_FRAME: usize = STX_PAYLOAD + FRAME_OVERHEAD;

/// Poll interval in timer ticks (1 ms tick).
pub const POLL_PERIOD_TICKS: u32 = 1000;

pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

// --- Boundary traits ---

/// Outgoing side of the transport: acknowledgments and poll bytes.
pub trait FramePort {
    type Error;
    fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
}

/// Status a payload consumer reports back for the deferred acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum ReplyInfo {
    /// Payload consumed; acknowledge positively.
    Ok,
    /// Payload could not be consumed; request a retransmission.
    Failed,
    /// Consumer aborts the whole transfer.
    Cancelled,
    /// Still working; keep the acknowledgment deferred.
    Pending,
}

/// Consumer of accepted frame payloads (typically a flash image writer).
pub trait PayloadSink {
    /// Take ownership of an accepted payload. May be slow (flash writes);
    /// the acknowledgment waits for [`PayloadSink::poll_reply`].
    fn prepare(&mut self, payload: &[u8]);

    /// Report the fate of the payload last handed to `prepare`.
    fn poll_reply(&mut self) -> ReplyInfo;
}

/// Per-frame classification surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum FrameOutcome {
    Ok,
    /// Retransmission of the previous frame; previous reply resent.
    DuplicateFrame,
    /// Sequence number is neither expected nor expected-1; a frame was lost.
    OmissionFrame,
    /// Complement byte does not match the sequence byte.
    PacketNumberError,
    /// Frame length does not match the length implied by its marker.
    FrameLengthError,
    /// Payload CRC mismatch.
    FrameVerifyError,
    /// Event not legal in the current flow state.
    FlowError,
}

/// Transfer progress, distinct from per-frame sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum FlowState {
    Idle,
    Receiving,
    /// First end marker seen; waiting for the confirming second one.
    FirstTerminator,
    Success,
    Cancelled,
}

// --- Frame assembly ---

/// Assembles transport bytes into complete frames using a single reusable
/// buffer. Bytes that are not a valid frame marker while idle are discarded
/// as line noise.
pub struct Deframer {
    buf: [u8; MAX_FRAME],
    len: usize,
    want: usize,
}

impl Deframer {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME],
            len: 0,
            want: 0,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.want = 0;
    }

    /// Feed one byte; returns the completed frame when one is ready.
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        if self.len == 0 {
            match byte {
                EOT | CAN => {
                    self.buf[0] = byte;
                    return Some(&self.buf[..1]);
                }
                SOH => self.want = SOH_PAYLOAD + FRAME_OVERHEAD,
                STX => self.want = STX_PAYLOAD + FRAME_OVERHEAD,
                _ => return None,
            }
        }
        self.buf[self.len] = byte;
        self.len += 1;
        if self.len == self.want {
            let n = self.want;
            self.len = 0;
            self.want = 0;
            return Some(&self.buf[..n]);
        }
        None
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

// --- Session state machine ---

/// One in-flight transfer. Created when a session starts, reset on
/// cancel/completion/explicit reset, never persisted across reboot.
pub struct TransferSession {
    expected_seq: u8,
    flow: FlowState,
    /// A payload is with the sink and its acknowledgment is deferred.
    processing: bool,
    /// Reply sent for the last accepted data frame, resent on duplicates.
    last_data_reply: u8,
    poll_timer: Option<TimerHandle>,
}

impl TransferSession {
    pub fn new() -> Self {
        Self {
            expected_seq: 0,
            flow: FlowState::Idle,
            processing: false,
            last_data_reply: NAK,
            poll_timer: None,
        }
    }

    pub fn flow(&self) -> FlowState {
        self.flow
    }

    pub fn expected_seq(&self) -> u8 {
        self.expected_seq
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Begin a session: clear transient state and arm the periodic poll
    /// timer that announces the receiver to the sender.
    pub fn start<const N: usize>(&mut self, timer: TimerHandle, timers: &mut TimerPool<N>) {
        self.clear();
        self.poll_timer = Some(timer);
        timers.arm_periodic(timer, POLL_PERIOD_TICKS);
    }

    /// Explicit reset: clears protocol transient state and disarms the poll
    /// timer. The timer handle stays associated for a later `start`.
    pub fn reset<const N: usize>(&mut self, timers: &mut TimerPool<N>) {
        if let Some(timer) = self.poll_timer {
            timers.disarm(timer);
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.expected_seq = 0;
        self.flow = FlowState::Idle;
        self.processing = false;
        self.last_data_reply = NAK;
    }

    /// Emit the idle poll byte when the retry timer has expired.
    pub fn service_timer<P: FramePort, const N: usize>(
        &mut self,
        timers: &mut TimerPool<N>,
        port: &mut P,
    ) -> Result<(), P::Error> {
        if let Some(timer) = self.poll_timer {
            if timers.take_expired(timer) {
                port.send(&[POLL])?;
            }
        }
        Ok(())
    }

    /// Process one complete frame.
    pub fn handle_frame<S, P, const N: usize>(
        &mut self,
        frame: &[u8],
        sink: &mut S,
        port: &mut P,
        timers: &mut TimerPool<N>,
    ) -> Result<FrameOutcome, P::Error>
    where
        S: PayloadSink,
        P: FramePort,
    {
        let Some(&marker) = frame.first() else {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::FrameLengthError);
        };
        match marker {
            CAN => {
                // Cancel is honoured from any state and always ACKed.
                log::warn!("transfer cancelled by sender");
                self.flow = FlowState::Cancelled;
                self.processing = false;
                if let Some(timer) = self.poll_timer {
                    timers.disarm(timer);
                }
                port.send(&[ACK])?;
                Ok(FrameOutcome::Ok)
            }
            EOT => self.handle_terminator(port, timers),
            SOH | STX => self.handle_data(frame, sink, port, timers),
            _ => {
                port.send(&[NAK])?;
                Ok(FrameOutcome::FlowError)
            }
        }
    }

    fn handle_terminator<P: FramePort, const N: usize>(
        &mut self,
        port: &mut P,
        timers: &mut TimerPool<N>,
    ) -> Result<FrameOutcome, P::Error> {
        match self.flow {
            // Two consecutive end markers are required before acceptance.
            FlowState::Receiving => {
                self.flow = FlowState::FirstTerminator;
                port.send(&[NAK])?;
                Ok(FrameOutcome::Ok)
            }
            FlowState::FirstTerminator => {
                self.flow = FlowState::Success;
                self.expected_seq = 0;
                port.send(&[ACK])?;
                // Restarted exactly once: announce readiness for a possible
                // next file in a multi-file batch.
                if let Some(timer) = self.poll_timer {
                    timers.arm_periodic(timer, POLL_PERIOD_TICKS);
                }
                log::info!("transfer complete");
                Ok(FrameOutcome::Ok)
            }
            _ => {
                port.send(&[NAK])?;
                Ok(FrameOutcome::FlowError)
            }
        }
    }

    fn handle_data<S, P, const N: usize>(
        &mut self,
        frame: &[u8],
        sink: &mut S,
        port: &mut P,
        timers: &mut TimerPool<N>,
    ) -> Result<FrameOutcome, P::Error>
    where
        S: PayloadSink,
        P: FramePort,
    {
        match self.flow {
            FlowState::Cancelled => {
                port.send(&[NAK])?;
                return Ok(FrameOutcome::FlowError);
            }
            FlowState::FirstTerminator => {
                // A data frame between the two end markers breaks the
                // terminator sequence; the markers must be consecutive, so
                // the handshake restarts from scratch.
                self.flow = FlowState::Receiving;
                port.send(&[NAK])?;
                return Ok(FrameOutcome::FlowError);
            }
            _ => {}
        }
        if self.processing {
            // The previous payload is still with the sink; the sender must
            // wait for its acknowledgment before sending more.
            port.send(&[NAK])?;
            return Ok(FrameOutcome::FlowError);
        }

        let payload_len = if frame[0] == SOH {
            SOH_PAYLOAD
        } else {
            STX_PAYLOAD
        };
        if frame.len() < 3 {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::FrameLengthError);
        }
        let seq = frame[1];

        // Retransmission of the previous frame is distinguished from a lost
        // frame before anything else, so a NAK loop cannot corrupt state.
        // Duplicates only make sense mid-stream.
        let duplicate =
            self.flow == FlowState::Receiving && seq == self.expected_seq.wrapping_sub(1);
        if !duplicate && seq != self.expected_seq {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::OmissionFrame);
        }

        if frame[2] != !seq {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::PacketNumberError);
        }
        if frame.len() != payload_len + FRAME_OVERHEAD {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::FrameLengthError);
        }

        let payload = &frame[3..3 + payload_len];
        let received = u16::from_be_bytes([frame[3 + payload_len], frame[4 + payload_len]]);
        if CRC16.checksum(payload) != received {
            port.send(&[NAK])?;
            return Ok(FrameOutcome::FrameVerifyError);
        }

        if duplicate {
            // Already-accepted data is trusted and not reprocessed, but the
            // retransmitted frame had to validate before this reply.
            port.send(&[self.last_data_reply])?;
            return Ok(FrameOutcome::DuplicateFrame);
        }

        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.flow = FlowState::Receiving;
        // Paused while frames are actively arriving.
        if let Some(timer) = self.poll_timer {
            timers.disarm(timer);
        }
        sink.prepare(payload);
        self.processing = true;
        Ok(FrameOutcome::Ok)
    }

    /// Drive the deferred acknowledgment of the payload currently with the
    /// sink. Returns the sink status that was acted upon, if any.
    pub fn poll<S, P>(&mut self, sink: &mut S, port: &mut P) -> Result<Option<ReplyInfo>, P::Error>
    where
        S: PayloadSink,
        P: FramePort,
    {
        if !self.processing {
            return Ok(None);
        }
        let status = sink.poll_reply();
        match status {
            ReplyInfo::Pending => {}
            ReplyInfo::Ok => {
                self.processing = false;
                self.last_data_reply = ACK;
                port.send(&[ACK])?;
            }
            ReplyInfo::Failed => {
                // Step the expected sequence back to force a retransmission.
                self.processing = false;
                self.expected_seq = self.expected_seq.wrapping_sub(1);
                self.last_data_reply = NAK;
                port.send(&[NAK])?;
            }
            ReplyInfo::Cancelled => {
                log::warn!("transfer aborted by payload consumer");
                self.processing = false;
                self.flow = FlowState::Cancelled;
                port.send(&[CAN])?;
            }
        }
        Ok(Some(status))
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

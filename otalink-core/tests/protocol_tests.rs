// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Transfer protocol state machine tests: framing, sequence validation,
//! duplicate handling, termination and the deferred acknowledgment path.

use otalink_core::protocol::{
    Deframer, FlowState, FrameOutcome, FramePort, PayloadSink, ReplyInfo, TransferSession, ACK,
    CAN, CRC16, EOT, NAK, POLL, POLL_PERIOD_TICKS, SOH, SOH_PAYLOAD, STX, STX_PAYLOAD,
};
use otalink_core::timer::{TimerHandle, TimerPool};

#[derive(Default)]
struct RecordPort {
    sent: Vec<u8>,
}

impl FramePort for RecordPort {
    type Error = std::convert::Infallible;

    fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.sent.extend_from_slice(buf);
        Ok(())
    }
}

impl RecordPort {
    fn last(&self) -> u8 {
        *self.sent.last().unwrap()
    }
}

/// Sink that records delivered payloads and answers with a scripted reply.
struct ScriptedSink {
    payloads: Vec<Vec<u8>>,
    reply: ReplyInfo,
}

impl ScriptedSink {
    fn new(reply: ReplyInfo) -> Self {
        Self {
            payloads: Vec::new(),
            reply,
        }
    }
}

impl PayloadSink for ScriptedSink {
    fn prepare(&mut self, payload: &[u8]) {
        self.payloads.push(payload.to_vec());
    }

    fn poll_reply(&mut self) -> ReplyInfo {
        self.reply
    }
}

fn frame(marker: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![marker, seq, !seq];
    out.extend_from_slice(payload);
    out.extend_from_slice(&CRC16.checksum(payload).to_be_bytes());
    out
}

fn soh_frame(seq: u8, fill: u8) -> Vec<u8> {
    frame(SOH, seq, &[fill; SOH_PAYLOAD])
}

fn started_session(timers: &mut TimerPool<4>) -> (TransferSession, TimerHandle) {
    let mut session = TransferSession::new();
    let timer = timers.alloc().unwrap();
    session.start(timer, timers);
    (session, timer)
}

/// Deliver a frame and drive the deferred acknowledgment to completion.
fn deliver(
    session: &mut TransferSession,
    frame: &[u8],
    sink: &mut ScriptedSink,
    port: &mut RecordPort,
    timers: &mut TimerPool<4>,
) -> FrameOutcome {
    let outcome = session.handle_frame(frame, sink, port, timers).unwrap();
    while session.is_processing() {
        session.poll(sink, port).unwrap();
    }
    outcome
}

#[test]
fn test_deframer_assembles_frames_and_discards_noise() {
    let mut deframer = Deframer::new();

    // Line noise while idle is dropped.
    assert!(deframer.push(0x00).is_none());
    assert!(deframer.push(0x7F).is_none());

    // EOT and CAN are complete frames on their own.
    assert_eq!(deframer.push(EOT), Some(&[EOT][..]));
    assert_eq!(deframer.push(CAN), Some(&[CAN][..]));

    // A SOH frame completes after 128 payload bytes plus overhead.
    let bytes = soh_frame(0, 0xAB);
    let mut got = None;
    for &b in &bytes {
        if let Some(f) = deframer.push(b) {
            got = Some(f.to_vec());
        }
    }
    assert_eq!(got.as_deref(), Some(&bytes[..]));

    // And a STX frame after 1024.
    let bytes = frame(STX, 1, &[0x55; STX_PAYLOAD]);
    let mut got = None;
    for &b in &bytes {
        if let Some(f) = deframer.push(b) {
            got = Some(f.to_vec());
        }
    }
    assert_eq!(got.as_deref(), Some(&bytes[..]));
}

#[test]
fn test_in_order_frames_are_acked_and_delivered() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    for seq in 0..3u8 {
        let outcome = deliver(
            &mut session,
            &soh_frame(seq, seq),
            &mut sink,
            &mut port,
            &mut timers,
        );
        assert_eq!(outcome, FrameOutcome::Ok);
        assert_eq!(port.last(), ACK);
    }
    assert_eq!(sink.payloads.len(), 3);
    assert_eq!(session.expected_seq(), 3);
    assert_eq!(session.flow(), FlowState::Receiving);
}

#[test]
fn test_duplicate_resends_reply_without_redelivery() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert_eq!(sink.payloads.len(), 1);

    // The sender missed the ACK and retransmits frame 0.
    let outcome = deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::DuplicateFrame);
    assert_eq!(port.last(), ACK);
    // Already-written data is not handed to the sink again.
    assert_eq!(sink.payloads.len(), 1);
    assert_eq!(session.expected_seq(), 1);
}

#[test]
fn test_corrupt_duplicate_is_not_acknowledged() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);

    // A duplicate must still pass CRC validation before its reply is resent.
    let mut bad = soh_frame(0, 1);
    let n = bad.len();
    bad[n - 1] ^= 0xFF;
    let outcome = deliver(&mut session, &bad, &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FrameVerifyError);
    assert_eq!(port.last(), NAK);
}

#[test]
fn test_frame_validation_failures() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    // Sequence jump: a frame was lost.
    let outcome = deliver(&mut session, &soh_frame(2, 0), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::OmissionFrame);
    assert_eq!(port.last(), NAK);

    // Complement byte does not match.
    let mut bad = soh_frame(0, 0);
    bad[2] = 0x42;
    let outcome = deliver(&mut session, &bad, &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::PacketNumberError);

    // SOH marker with a truncated payload.
    let mut short = soh_frame(0, 0);
    short.truncate(40);
    let outcome = deliver(&mut session, &short, &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FrameLengthError);

    // Payload CRC mismatch.
    let mut corrupt = soh_frame(0, 0);
    corrupt[10] ^= 0x01;
    let outcome = deliver(&mut session, &corrupt, &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FrameVerifyError);

    // None of the failures advanced the session or reached the sink.
    assert_eq!(session.expected_seq(), 0);
    assert!(sink.payloads.is_empty());
}

#[test]
fn test_double_terminator_required_for_success() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, timer) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);

    // First EOT is challenged with a NAK.
    deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), NAK);
    assert_eq!(session.flow(), FlowState::FirstTerminator);

    // Second consecutive EOT completes the transfer and resets the
    // sequence.
    deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), ACK);
    assert_eq!(session.flow(), FlowState::Success);
    assert_eq!(session.expected_seq(), 0);
    // Poll timer is re-armed once for a possible next file.
    assert!(timers.is_armed(timer));
}

#[test]
fn test_data_frame_breaks_terminator_sequence() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(session.flow(), FlowState::FirstTerminator);

    // A data frame between the two end markers is refused and resets the
    // handshake: the markers must be consecutive.
    let outcome = deliver(&mut session, &soh_frame(1, 2), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FlowError);
    assert_eq!(session.flow(), FlowState::Receiving);

    // A single EOT after the interruption is only the first marker again.
    deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), NAK);
    assert_eq!(session.flow(), FlowState::FirstTerminator);

    deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), ACK);
    assert_eq!(session.flow(), FlowState::Success);
}

#[test]
fn test_terminator_before_any_data_is_flow_error() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    let outcome = deliver(&mut session, &[EOT], &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FlowError);
    assert_eq!(port.last(), NAK);
    assert_eq!(session.flow(), FlowState::Idle);
}

#[test]
fn test_sender_cancel_is_honoured_from_any_state() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, timer) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    deliver(&mut session, &[CAN], &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), ACK);
    assert_eq!(session.flow(), FlowState::Cancelled);
    assert!(!timers.is_armed(timer));

    // No further data is accepted until reset.
    let outcome = deliver(&mut session, &soh_frame(1, 2), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::FlowError);

    session.reset(&mut timers);
    assert_eq!(session.flow(), FlowState::Idle);
    assert_eq!(session.expected_seq(), 0);
}

#[test]
fn test_sink_failure_forces_retransmission() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Failed);
    let mut port = RecordPort::default();

    let outcome = deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::Ok);
    assert_eq!(port.last(), NAK);
    // The sequence stepped back so the retransmission is accepted as new.
    assert_eq!(session.expected_seq(), 0);

    sink.reply = ReplyInfo::Ok;
    let outcome = deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert_eq!(outcome, FrameOutcome::Ok);
    assert_eq!(port.last(), ACK);
    assert_eq!(sink.payloads.len(), 2);
    assert_eq!(session.expected_seq(), 1);
}

#[test]
fn test_sink_cancel_aborts_transfer() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Cancelled);
    let mut port = RecordPort::default();

    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert_eq!(port.last(), CAN);
    assert_eq!(session.flow(), FlowState::Cancelled);
}

#[test]
fn test_pending_reply_keeps_acknowledgment_deferred() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, _) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Pending);
    let mut port = RecordPort::default();

    session
        .handle_frame(&soh_frame(0, 1), &mut sink, &mut port, &mut timers)
        .unwrap();
    let sent_before = port.sent.len();
    assert_eq!(
        session.poll(&mut sink, &mut port).unwrap(),
        Some(ReplyInfo::Pending)
    );
    assert!(session.is_processing());
    assert_eq!(port.sent.len(), sent_before);

    // New data while a payload is still with the sink is refused.
    let outcome = session
        .handle_frame(&soh_frame(1, 2), &mut sink, &mut port, &mut timers)
        .unwrap();
    assert_eq!(outcome, FrameOutcome::FlowError);
    assert_eq!(port.last(), NAK);

    // The sink finishing releases the ACK.
    sink.reply = ReplyInfo::Ok;
    assert_eq!(
        session.poll(&mut sink, &mut port).unwrap(),
        Some(ReplyInfo::Ok)
    );
    assert_eq!(port.last(), ACK);
    assert!(!session.is_processing());
}

#[test]
fn test_poll_byte_emitted_while_idle_and_paused_while_receiving() {
    let mut timers = TimerPool::<4>::new();
    let (mut session, timer) = started_session(&mut timers);
    let mut sink = ScriptedSink::new(ReplyInfo::Ok);
    let mut port = RecordPort::default();

    for _ in 0..POLL_PERIOD_TICKS {
        timers.tick();
    }
    session.service_timer(&mut timers, &mut port).unwrap();
    assert_eq!(port.last(), POLL);

    // Once data flows the poll timer is disarmed.
    deliver(&mut session, &soh_frame(0, 1), &mut sink, &mut port, &mut timers);
    assert!(!timers.is_armed(timer));
    let sent_before = port.sent.len();
    for _ in 0..2 * POLL_PERIOD_TICKS {
        timers.tick();
    }
    session.service_timer(&mut timers, &mut port).unwrap();
    assert_eq!(port.sent.len(), sent_before);
}

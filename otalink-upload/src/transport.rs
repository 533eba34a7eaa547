// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Serial transport layer: sender side of the framed transfer protocol.
//!
//! Frames are marker + sequence + complement + fixed payload + CRC-16
//! (XMODEM, big-endian). The receiver answers every frame with a single
//! status byte and announces readiness with a poll byte while idle.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serialport::SerialPort;

use otalink_core::protocol::{ACK, CAN, CRC16, EOT, NAK, POLL};

/// Default timeout for serial operations in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Retransmissions per frame before the transfer is abandoned.
pub const MAX_RETRIES: usize = 10;

/// Serial transport talking to an otalink receiver.
pub struct Transport {
    port: Box<dyn SerialPort>,
}

impl Transport {
    /// Create a new transport connection to the specified serial port.
    pub fn new(port_name: &str) -> Result<Self> {
        Self::with_timeout(port_name, DEFAULT_TIMEOUT_MS)
    }

    /// Create a new transport connection with a custom timeout.
    pub fn with_timeout(port_name: &str, timeout_ms: u64) -> Result<Self> {
        let port = serialport::new(port_name, 115200)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .with_context(|| format!("Failed to open serial port {}", port_name))?;

        Ok(Self { port })
    }

    /// Get the port name.
    pub fn port_name(&self) -> String {
        self.port.name().unwrap_or_else(|| "?".to_string())
    }

    fn drain_rx(&mut self) {
        let mut buf = [0u8; 64];
        let old_timeout = self.port.timeout();
        let _ = self.port.set_timeout(Duration::from_millis(10));
        while self.port.read(&mut buf).unwrap_or(0) > 0 {}
        let _ = self.port.set_timeout(old_timeout);
    }

    /// Block until the receiver emits its poll byte.
    pub fn wait_poll(&mut self, deadline_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) if byte[0] == POLL => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => bail!("Serial read error: {}", e),
            }
            if Instant::now() >= deadline {
                bail!("Timeout waiting for receiver poll");
            }
        }
    }

    /// Read the next status byte, skipping stale poll bytes.
    pub fn read_reply(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) if byte[0] != POLL => return Ok(byte[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    bail!("Timeout waiting for receiver reply");
                }
                Err(e) => bail!("Serial read error: {}", e),
            }
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port
            .write_all(bytes)
            .map_err(|e| anyhow::anyhow!("Failed to write to serial port: {}", e))?;
        self.port.flush()?;
        Ok(())
    }

    /// Send one data frame and retry on NAK until it is acknowledged.
    pub fn send_frame(&mut self, marker: u8, seq: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(marker);
        frame.push(seq);
        frame.push(!seq);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&CRC16.checksum(payload).to_be_bytes());

        for _ in 0..MAX_RETRIES {
            self.send_raw(&frame)?;
            match self.read_reply()? {
                ACK => return Ok(()),
                NAK => continue,
                CAN => bail!("Transfer cancelled by receiver"),
                other => bail!("Unexpected reply byte 0x{:02x}", other),
            }
        }
        bail!("Frame {} rejected {} times, giving up", seq, MAX_RETRIES)
    }

    /// Send the double end-of-transfer handshake: the first EOT must be
    /// challenged with a NAK, the second accepted with an ACK.
    pub fn send_terminator(&mut self) -> Result<()> {
        self.send_raw(&[EOT])?;
        match self.read_reply()? {
            NAK => {}
            other => bail!("Expected challenge to first EOT, got 0x{:02x}", other),
        }
        self.send_raw(&[EOT])?;
        match self.read_reply()? {
            ACK => Ok(()),
            other => bail!("Transfer not accepted, reply 0x{:02x}", other),
        }
    }

    /// Send a cancel byte and wait for its acknowledgment.
    pub fn send_cancel(&mut self) -> Result<()> {
        self.drain_rx();
        self.send_raw(&[CAN])?;
        match self.read_reply()? {
            ACK => Ok(()),
            other => bail!("Cancel not acknowledged, reply 0x{:02x}", other),
        }
    }
}

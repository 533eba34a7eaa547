// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations: image packaging and the sender-side transfer
//! sequence.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use otalink_core::image::ImageHeader;
use otalink_core::protocol::{SOH, SOH_PAYLOAD, STX, STX_PAYLOAD};

use crate::transport::Transport;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// How long to wait for the receiver's poll byte before giving up. Covers a
/// receiver that is still erasing flash from a previous attempt.
const POLL_DEADLINE_MS: u64 = 30_000;

/// Upload a firmware image to the named destination partition.
pub fn upload(
    transport: &mut Transport,
    file: &Path,
    dest: &str,
    version: u32,
    raw: bool,
) -> Result<()> {
    let contents =
        fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let image = if raw {
        let header = ImageHeader::parse(&contents)
            .filter(|h| h.is_valid_magic())
            .ok_or_else(|| anyhow::anyhow!("{} does not start with an image header", file.display()))?;
        println!(
            "Packaged image: {} ({} bytes, version {})",
            file.display(),
            contents.len(),
            header.version
        );
        contents
    } else {
        let crc32 = CRC32.checksum(&contents);
        println!(
            "Firmware: {} ({} bytes, CRC32: 0x{:08x})",
            file.display(),
            contents.len(),
            crc32
        );
        println!("Version:  {}", version);
        let header = ImageHeader::new(version, contents.len() as u32, crc32, 0);
        let mut image = header.to_bytes().to_vec();
        image.extend_from_slice(&contents);
        image
    };

    println!("Target:   {}", dest);
    println!();

    print!("Waiting for receiver... ");
    std::io::stdout().flush()?;
    transport.wait_poll(POLL_DEADLINE_MS)?;
    println!("OK");

    // Block 0 names the destination and announces the image length; the
    // receiver erases the target partition before acknowledging, which can
    // take a while on large parts.
    transport.send_frame(SOH, 0, &metadata_block(dest, image.len() as u32)?)?;

    let pb = ProgressBar::new(image.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    // Full kilobyte blocks first, then the remainder in small frames.
    let mut seq = 1u8;
    let mut offset = 0usize;
    while offset < image.len() {
        let remaining = image.len() - offset;
        if remaining >= STX_PAYLOAD {
            if let Err(e) = transport.send_frame(STX, seq, &image[offset..offset + STX_PAYLOAD]) {
                pb.abandon();
                return Err(e).with_context(|| format!("Transfer failed at offset {}", offset));
            }
            offset += STX_PAYLOAD;
        } else {
            let n = remaining.min(SOH_PAYLOAD);
            let mut tail = [0xFFu8; SOH_PAYLOAD];
            tail[..n].copy_from_slice(&image[offset..offset + n]);
            if let Err(e) = transport.send_frame(SOH, seq, &tail) {
                pb.abandon();
                return Err(e).with_context(|| format!("Transfer failed at offset {}", offset));
            }
            offset += n;
        }
        seq = seq.wrapping_add(1);
        pb.set_position(offset as u64);
    }
    pb.finish_with_message("Transfer complete");
    println!();

    print!("Finalizing... ");
    std::io::stdout().flush()?;
    transport.send_terminator()?;
    println!("OK");

    // Close the batch: an empty destination name tells the receiver no
    // further file follows.
    transport.wait_poll(POLL_DEADLINE_MS)?;
    transport.send_frame(SOH, 0, &[0u8; SOH_PAYLOAD])?;

    println!();
    println!("Firmware uploaded successfully!");
    println!(
        "The receiver on {} validates the image and applies it on the next update boot.",
        transport.port_name()
    );

    Ok(())
}

/// Cancel a transfer the receiver believes is still in progress.
pub fn cancel(transport: &mut Transport) -> Result<()> {
    print!("Cancelling transfer... ");
    std::io::stdout().flush()?;
    transport.send_cancel()?;
    println!("OK");
    Ok(())
}

/// Block 0 layout: NUL-terminated destination name followed by the image
/// length in ASCII decimal.
fn metadata_block(dest: &str, len: u32) -> Result<[u8; SOH_PAYLOAD]> {
    let digits = len.to_string();
    if dest.len() + 1 + digits.len() > SOH_PAYLOAD {
        bail!("Destination name too long: {}", dest);
    }
    if dest.is_empty() || dest.bytes().any(|b| b == 0) {
        bail!("Invalid destination name: {:?}", dest);
    }
    let mut block = [0u8; SOH_PAYLOAD];
    block[..dest.len()].copy_from_slice(dest.as_bytes());
    block[dest.len() + 1..dest.len() + 1 + digits.len()].copy_from_slice(digits.as_bytes());
    Ok(block)
}

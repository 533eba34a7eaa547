// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware upload tool for otalink receivers over a serial link.
//!
//! Usage:
//!   otalink-upload --port /dev/ttyACM0 upload firmware.bin --version 2
//!   otalink-upload --port /dev/ttyACM0 upload packaged.img --raw --dest staging
//!   otalink-upload --port /dev/ttyACM0 cancel

mod cli;
mod commands;
mod transport;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args)
}

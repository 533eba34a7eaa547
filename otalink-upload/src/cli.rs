// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;
use crate::transport::Transport;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "otalink-upload")]
#[command(about = "Firmware upload tool for otalink receivers")]
pub struct Cli {
    /// Serial port (e.g., /dev/ttyACM0)
    #[arg(short, long)]
    pub port: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Upload a firmware image
    Upload {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Destination partition name announced to the receiver
        #[arg(short, long, default_value = "staging")]
        dest: String,

        /// Firmware version number written into the image header
        #[arg(short, long, default_value = "1")]
        version: u32,

        /// Send the file as-is; it already carries an image header
        #[arg(long)]
        raw: bool,
    },

    /// Cancel a transfer the receiver believes is still in progress
    Cancel,
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let mut transport = Transport::new(&cli.port)?;

    match cli.command {
        Commands::Upload {
            file,
            dest,
            version,
            raw,
        } => commands::upload(&mut transport, &file, &dest, version, raw),
        Commands::Cancel => commands::cancel(&mut transport),
    }
}

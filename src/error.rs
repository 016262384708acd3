// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Fatal error conditions that terminate the sniffer.
///
/// Per-frame anomalies (CRC mismatches, unknown function codes, short
/// frames) are not errors: the state machine handles them through
/// [`Outcome`](crate::decoder::Outcome) values and log warnings while the
/// capture continues.
#[derive(Debug, Error)]
pub enum Error {
    /// A dictionary file could not be opened at startup.
    #[error("cannot open definition file {path}: {source}")]
    DefinitionFile { path: PathBuf, source: io::Error },

    /// The serial port could not be opened or configured.
    #[error("cannot open serial port {path}: {source}")]
    PortOpen {
        path: String,
        source: tokio_serial::Error,
    },

    /// The requested baud rate is not a known serial line speed.
    #[error("baud rate not supported: {0}")]
    BaudRate(u32),

    /// The capture was directed at stdout, but stdout is a terminal.
    #[error("capture file is binary, redirect it to a file or use the --output option")]
    CaptureIsTerminal,

    /// The capture file could not be created.
    #[error("cannot open output file {path}: {source}")]
    CaptureOpen { path: PathBuf, source: io::Error },

    /// Writing the capture file failed. The file is truncated on open, so
    /// a failed write leaves it unusable and the capture must stop.
    #[error("cannot write capture file: {0}")]
    CaptureWrite(#[source] io::Error),

    /// Reading from the serial port failed with something other than the
    /// inter-frame timeout.
    #[error("cannot read serial port: {0}")]
    PortRead(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

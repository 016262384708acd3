// SPDX-FileCopyrightText: Copyright (c) 2023-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Legacy pcap capture sink.
//!
//! The classic pcap format is a 24-byte global header followed by one
//! 16-byte record header plus payload per packet, all little-endian here.
//! Modbus RTU has no assigned link type, so captures default to
//! [`DLT_USER0`] and analyzers have to be told what they are looking at.
//!
//! A capture file is truncated on open, so any write failure leaves it
//! unusable; write errors are therefore fatal and not retried.

use std::{
    fs::File,
    io::{self, BufWriter, IsTerminal as _, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// pcap link type 147, reserved for user-defined protocols.
pub const DLT_USER0: u32 = 147;

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAP_LEN: u32 = 1024;
const GLOBAL_HEADER_LEN: usize = 24;
const PACKET_HEADER_LEN: usize = 16;

#[derive(Debug)]
enum Sink {
    File(BufWriter<File>),
    Stdout(io::Stdout),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(file) => file.write(buf),
            Self::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(file) => file.flush(),
            Self::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// Writes Modbus frames as packets of a legacy pcap stream.
#[derive(Debug)]
pub struct PcapWriter {
    path: PathBuf,
    network: u32,
    sink: Sink,
    packets: u64,
}

impl PcapWriter {
    /// Truncate-creates the capture file and emits the global header.
    ///
    /// The path `-` selects stdout, which is rejected when stdout is a
    /// terminal: nobody wants a binary capture garbling their shell.
    pub fn create(path: impl AsRef<Path>, network: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sink = open_sink(&path)?;
        let mut writer = Self {
            path,
            network,
            sink,
            packets: 0,
        };
        writer.write_global_header()?;
        Ok(writer)
    }

    /// Packets written to the stream since it was last (re)opened.
    #[must_use]
    pub const fn packets(&self) -> u64 {
        self.packets
    }

    /// Appends one packet record stamped with the current wall clock.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_packet(&mut self, frame: &[u8]) -> Result<()> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut record = BytesMut::with_capacity(PACKET_HEADER_LEN + frame.len());
        record.put_u32_le(elapsed.as_secs() as u32);
        record.put_u32_le(elapsed.subsec_micros());
        // Frames are captured whole, so the included and original lengths
        // are always equal.
        record.put_u32_le(frame.len() as u32);
        record.put_u32_le(frame.len() as u32);
        record.put_slice(frame);
        self.write_all(&record)?;
        self.packets += 1;
        Ok(())
    }

    /// Closes the capture and reopens it at the same path, truncating.
    ///
    /// On a stdout capture there is nothing to reopen; a fresh global
    /// header marks the cut instead.
    pub fn rotate(&mut self) -> Result<()> {
        log::info!(
            "rotating capture file {} after {} packets",
            self.path.display(),
            self.packets
        );
        self.sink.flush().map_err(Error::CaptureWrite)?;
        self.sink = open_sink(&self.path)?;
        self.packets = 0;
        self.write_global_header()
    }

    fn write_global_header(&mut self) -> Result<()> {
        let mut header = BytesMut::with_capacity(GLOBAL_HEADER_LEN);
        header.put_u32_le(PCAP_MAGIC);
        header.put_u16_le(VERSION_MAJOR);
        header.put_u16_le(VERSION_MINOR);
        header.put_i32_le(0); // thiszone
        header.put_u32_le(0); // sigfigs
        header.put_u32_le(SNAP_LEN);
        header.put_u32_le(self.network);
        self.write_all(&header)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink
            .write_all(bytes)
            .and_then(|()| self.sink.flush())
            .map_err(Error::CaptureWrite)
    }
}

fn open_sink(path: &Path) -> Result<Sink> {
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        if stdout.is_terminal() {
            return Err(Error::CaptureIsTerminal);
        }
        return Ok(Sink::Stdout(stdout));
    }
    let file = File::create(path).map_err(|source| Error::CaptureOpen {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Sink::File(BufWriter::new(file)))
}

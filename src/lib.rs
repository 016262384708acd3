// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A passive sniffer for the
//! [Modbus](https://en.wikipedia.org/wiki/Modbus) RTU serial protocol.
//!
//! Attached read-only to an RS-485 bus (typically through a UART/USB
//! adapter), the sniffer segments the raw byte stream into frames using the
//! inter-frame line-idle heuristic, validates each frame's CRC-16, decodes
//! requests and responses against user-supplied register and command
//! dictionaries, and persists every well-formed frame to a capture file in
//! the legacy pcap format for offline analysis with Wireshark and friends.
//!
//! Modbus RTU carries no transport-layer hint about which direction a frame
//! travels, so the decoder alternates between *expecting a request* and
//! *expecting a response* and corrects itself when a frame cannot possibly
//! belong to the expected direction.
//!
//! # Protocol-Specification
//!
//! - [MODBUS over serial line specification and implementation guide v1.02 (PDF)](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf)
//! - [MODBUS Application Protocol Specification v1.1b3 (PDF)](http://modbus.org/docs/Modbus_Application_Protocol_V1_1b3.pdf)

pub mod crc;
pub mod decoder;
pub mod dict;
pub mod pcap;
pub mod serial;
pub mod sniffer;

mod error;

pub use self::error::{Error, Result};

/// Maximum size of a Modbus RTU frame on the wire.
///
/// The serial line specification limits the ADU to 256 bytes; some vendors
/// exceed that, so the buffer follows the more tolerant 300 byte bound.
pub const MAX_FRAME_LEN: usize = 300;

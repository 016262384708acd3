// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU request/response decoder.
//!
//! A passive listener never knows for sure whether the next frame is a
//! request or a response: RTU frames carry no direction marker, and
//! request/response alternation breaks whenever a slave stays silent or a
//! master retries. The decoder therefore keeps an expected [`Direction`],
//! reports a [`Outcome::DirectionWrong`] verdict when the bytes cannot
//! belong to that direction, and leaves the retry policy to the caller.
//!
//! Responses do not echo the register address they answer for, so the
//! decoder remembers the start register of the most recent request and
//! interprets response payloads relative to it.

use std::fmt::Write as _;

use byteorder::{BigEndian, ByteOrder};

use crate::{
    crc,
    dict::{CommandTable, DataType, RegisterTable},
};

/// Direction the next frame on the bus is expected to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Master asking a slave.
    Request,
    /// Slave answering back.
    Response,
}

impl Direction {
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Request => Self::Response,
            Self::Response => Self::Request,
        }
    }
}

/// Verdict of a single decode attempt over the accumulated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The buffer held exactly one complete frame.
    Done,
    /// The frame is incomplete; at least this many bytes are missing.
    NeedsMoreBytes(usize),
    /// One frame was decoded and this many trailing bytes already belong
    /// to the next frame (piggybacked without a visible line gap).
    HasTrailingBytes(usize),
    /// The bytes cannot belong to a frame of the expected direction.
    DirectionWrong,
}

// Request ADU: slave(1) function(1) start-register(2) register-count(2) crc(2).
const REQUEST_LEN: usize = 8;
// Response ADU overhead around the payload: slave(1) function(1) byte-count(1) … crc(2).
const RESPONSE_HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

// ChINT/Hoymiles quirk, see [`known_vendor_bug`]. Bytes follow the slave id.
const BUGGY_REQUEST: [u8; 5] = [0x03, 0x20, 0x06, 0x00, 0x2C];
const BUGGY_RESPONSE: [u8; 12] = [
    0x03, 0x58, 0x45, 0x13, 0x80, 0x00, 0x45, 0x14, 0x00, 0x00, 0x45, 0x13,
];

/// Request/response state machine.
#[derive(Debug)]
pub struct Decoder {
    commands: CommandTable,
    registers: RegisterTable,
    direction: Direction,
    last_register: u16,
}

impl Decoder {
    #[must_use]
    pub fn new(commands: CommandTable, registers: RegisterTable) -> Self {
        Self {
            commands,
            registers,
            // A fresh capture starts with the master's turn.
            direction: Direction::Request,
            last_register: 0,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Start register of the most recent request, used to label the values
    /// of the following response.
    #[must_use]
    pub const fn last_register(&self) -> u16 {
        self.last_register
    }

    pub fn flip_direction(&mut self) {
        self.direction = self.direction.flipped();
    }

    /// Decodes the accumulated bytes as a frame of the expected direction.
    ///
    /// `prev_frame` is the most recent CRC-valid frame and feeds the
    /// vendor-bug fingerprint. On [`Outcome::Done`] and
    /// [`Outcome::HasTrailingBytes`] the expected direction has flipped;
    /// on [`Outcome::DirectionWrong`] it is up to the caller to flip and
    /// retry.
    pub fn decode(&mut self, frame: &[u8], prev_frame: &[u8]) -> Outcome {
        match self.direction {
            Direction::Request => self.decode_request(frame),
            Direction::Response => self.decode_response(frame, prev_frame),
        }
    }

    fn decode_request(&mut self, frame: &[u8]) -> Outcome {
        if frame.len() < REQUEST_LEN {
            return Outcome::NeedsMoreBytes(REQUEST_LEN - frame.len());
        }
        let slave = frame[0];
        let function = frame[1];
        let start = BigEndian::read_u16(&frame[2..4]);
        let count = BigEndian::read_u16(&frame[4..6]);
        self.last_register = start;

        let mut line = format!("? ID {slave} (0x{slave:02X}), ");
        match self.commands.get(function) {
            Some(cmd) => {
                let _ = write!(line, "{}, ", cmd.name);
                if count > cmd.max_at_once {
                    log::warn!(
                        "invalid attempt to request {count} registers at once, {} allows {}",
                        cmd.name,
                        cmd.max_at_once
                    );
                }
            }
            None => {
                let _ = write!(line, "Cmd_{function:02X}, ");
            }
        }
        match self.registers.get(start) {
            Some(reg) => {
                let _ = write!(line, "{}, ", reg.name);
            }
            None => {
                let _ = write!(line, "Reg{start:04X}, ");
            }
        }
        let _ = write!(
            line,
            "{count} registers ({} bytes) [{:02X} {:02X}]",
            u32::from(count) * 2,
            frame[6],
            frame[7]
        );
        log::info!("{line}");

        self.direction = self.direction.flipped();
        if frame.len() > REQUEST_LEN {
            Outcome::HasTrailingBytes(frame.len() - REQUEST_LEN)
        } else {
            Outcome::Done
        }
    }

    fn decode_response(&mut self, frame: &[u8], prev_frame: &[u8]) -> Outcome {
        if frame.len() < RESPONSE_HEADER_LEN {
            return Outcome::NeedsMoreBytes(RESPONSE_HEADER_LEN - frame.len());
        }
        let slave = frame[0];
        let function = frame[1];
        let mut byte_count = usize::from(frame[2]);

        if byte_count == 0 {
            // A response always carries payload. Such a frame is far more
            // likely a second request after a slave stayed silent.
            log::debug!("byte count 0 cannot be a response, try request decoding instead");
            return Outcome::DirectionWrong;
        }

        let available = frame.len() - RESPONSE_HEADER_LEN;
        if byte_count > available {
            if frame.len() > RESPONSE_HEADER_LEN + CRC_LEN
                && known_vendor_bug(frame, prev_frame)
                && crc::check_frame(frame)
            {
                let fixed = frame.len() - RESPONSE_HEADER_LEN - CRC_LEN;
                log::warn!(
                    "advertised byte count {byte_count} cannot be right, \
                     trusting the valid checksum and using {fixed}"
                );
                byte_count = fixed;
            } else {
                return Outcome::NeedsMoreBytes(byte_count - available);
            }
        }

        let payload = &frame[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + byte_count];
        let mut line = format!("! ID {slave} (0x{slave:02X}), ");
        match self.commands.get(function) {
            Some(cmd) => {
                let _ = write!(line, "{}, ", cmd.name);
            }
            None => {
                let _ = write!(line, "Cmd_{function:02X}, ");
            }
        }
        let _ = write!(line, "{byte_count} bytes, ");

        #[allow(clippy::cast_possible_truncation)]
        let register_count = (byte_count / 2) as u16;
        let mut offset = 0;
        for regno in 0..register_count {
            let address = self.last_register.wrapping_add(regno);
            let def = self.registers.get(address);
            match def {
                Some(reg) => {
                    let _ = write!(line, "{}: ", reg.name);
                }
                None => {
                    let _ = write!(line, "Reg{address:04X}: ");
                }
            }
            let step = match def {
                Some(reg) => {
                    let step = usize::from(reg.length);
                    if offset + step > payload.len() {
                        log::warn!(
                            "invalid attempt to dump {step} bytes for Reg{address:04X}, \
                             only {} left",
                            payload.len() - offset
                        );
                        let _ = write!(line, "{} ", hex_dump(&payload[offset..]));
                        payload.len() - offset
                    } else {
                        let _ = write!(
                            line,
                            "{} ",
                            render_value(reg.datatype, &payload[offset..offset + step])
                        );
                        step
                    }
                }
                None => {
                    // Unknown addresses are assumed to hold one plain word.
                    let step = 2.min(payload.len() - offset);
                    let _ = write!(line, "{} ", hex_dump(&payload[offset..offset + step]));
                    step
                }
            };
            offset += step;
            if offset >= payload.len() {
                break;
            }
        }

        let end_of_frame = RESPONSE_HEADER_LEN + byte_count + CRC_LEN;
        if frame.len() < end_of_frame {
            return Outcome::NeedsMoreBytes(end_of_frame - frame.len());
        }
        let _ = write!(
            line,
            "[{:02X} {:02X}]",
            frame[end_of_frame - 2],
            frame[end_of_frame - 1]
        );
        log::info!("{line}");

        self.direction = self.direction.flipped();
        if frame.len() > end_of_frame {
            Outcome::HasTrailingBytes(frame.len() - end_of_frame)
        } else {
            Outcome::Done
        }
    }
}

/// Fingerprint of a ChINT power meter answering a Hoymiles gateway.
///
/// The meter advertises a byte count of 0x58 (88) but actually sends a much
/// shorter frame whose checksum is valid over the bytes sent. When the
/// previous frame was the matching request, the advertised count is known
/// to be a lie and the checksum is trusted instead.
fn known_vendor_bug(answer: &[u8], request: &[u8]) -> bool {
    if request.len() < REQUEST_LEN || answer.len() < RESPONSE_HEADER_LEN {
        return false;
    }
    let request_body = &request[1..request.len() - CRC_LEN];
    let answer_body = &answer[1..answer.len() - CRC_LEN];
    request_body.len() <= BUGGY_REQUEST.len()
        && answer_body.len() <= BUGGY_RESPONSE.len()
        && *request_body == BUGGY_REQUEST[..request_body.len()]
        && *answer_body == BUGGY_RESPONSE[..answer_body.len()]
}

/// Renders one register value according to its datatype tag.
///
/// Multi-byte values are assembled big-endian (the "ABCD" orientation);
/// signed and float values reinterpret the unsigned bit pattern, so the
/// host byte order never leaks into the output. A window too short for the
/// datatype falls back to a hex dump.
fn render_value(datatype: DataType, window: &[u8]) -> String {
    match datatype {
        DataType::Void => String::new(),
        DataType::Dump => hex_dump(window),
        DataType::Bit => {
            let set = window.first().is_some_and(|&byte| byte > 0);
            if set { "1" } else { "0" }.to_owned()
        }
        DataType::Bits => {
            let mut out = String::with_capacity(window.len() * 8);
            for &byte in window {
                for bit in 0..8 {
                    out.push(if byte & (1 << bit) != 0 { '1' } else { '0' });
                }
            }
            out
        }
        DataType::U8 => window
            .first()
            .map_or_else(|| hex_dump(window), |&byte| format!("{{{byte}}}")),
        DataType::I8 => window
            .first()
            .map_or_else(|| hex_dump(window), |&byte| format!("{{{}}}", byte as i8)),
        DataType::U16 if window.len() >= 2 => {
            format!("{{{}}}", BigEndian::read_u16(window))
        }
        DataType::I16 if window.len() >= 2 => {
            format!("{{{}}}", BigEndian::read_u16(window) as i16)
        }
        DataType::U32 if window.len() >= 4 => {
            format!("{{{}}}", BigEndian::read_u32(window))
        }
        DataType::I32 if window.len() >= 4 => {
            #[allow(clippy::cast_possible_wrap)]
            let value = BigEndian::read_u32(window) as i32;
            format!("{{{value}}}")
        }
        DataType::F32 if window.len() >= 4 => {
            format!("{{{}}}", f32::from_bits(BigEndian::read_u32(window)))
        }
        // Window shorter than the datatype needs.
        _ => hex_dump(window),
    }
}

pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        let _ = write!(out, "{byte:02X} ");
    }
    out.truncate(out.trim_end().len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{CommandDef, RegisterDef};

    fn empty_decoder() -> Decoder {
        Decoder::new(CommandTable::default(), RegisterTable::default())
    }

    fn register(address: u16, length: u16, datatype: DataType, name: &str) -> RegisterDef {
        RegisterDef {
            address,
            length,
            orientation: "AB".into(),
            datatype,
            unit: String::new(),
            factor: 0.0,
            preferred_unit: String::new(),
            name: name.into(),
            description: String::new(),
        }
    }

    #[test]
    fn request_decodes_and_flips_direction() {
        let mut decoder = empty_decoder();
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::Done);
        assert_eq!(decoder.direction(), Direction::Response);
        assert_eq!(decoder.last_register(), 0x0000);
    }

    #[test]
    fn request_remembers_start_register() {
        let mut decoder = empty_decoder();
        let frame = [0x2C, 0x03, 0x20, 0x06, 0x00, 0x2C, 0xA9, 0xAB];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::Done);
        assert_eq!(decoder.last_register(), 0x2006);
    }

    #[test]
    fn short_request_needs_more_bytes() {
        let mut decoder = empty_decoder();
        assert_eq!(
            decoder.decode(&[0x01, 0x03, 0x00], &[]),
            Outcome::NeedsMoreBytes(5)
        );
        // Direction must not flip on an incomplete frame.
        assert_eq!(decoder.direction(), Direction::Request);
    }

    #[test]
    fn request_with_piggybacked_next_frame() {
        let mut decoder = empty_decoder();
        let mut bytes = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        bytes.extend_from_slice(&[0x01, 0x03, 0x14]);
        assert_eq!(decoder.decode(&bytes, &[]), Outcome::HasTrailingBytes(3));
        assert_eq!(decoder.direction(), Direction::Response);
    }

    #[test]
    fn oversized_register_count_is_still_decoded() {
        let commands: CommandTable = [CommandDef {
            function_code: 0x03,
            name: "ReadHoldingRegisters".into(),
            max_at_once: 4,
            min_address: 0,
            max_address: 0xFFFF,
            description: String::new(),
        }]
        .into_iter()
        .collect();
        let mut decoder = Decoder::new(commands, RegisterTable::default());
        // Asks for 10 registers although the dictionary allows 4 at once.
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::Done);
    }

    #[test]
    fn response_decodes_and_flips_direction() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        decoder.last_register = 0x0000;
        let frame = [0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02, 0x2A, 0x32];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::Done);
        assert_eq!(decoder.direction(), Direction::Request);
    }

    #[test]
    fn response_with_zero_byte_count_is_direction_wrong() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        let frame = [0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0xD5, 0xCA];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::DirectionWrong);
        // Flipping and retrying is the caller's job.
        assert_eq!(decoder.direction(), Direction::Response);
    }

    #[test]
    fn incomplete_response_payload_needs_more_bytes() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        // Advertises 20 payload bytes but only 9 arrived so far.
        let mut frame = vec![0x01, 0x03, 0x14];
        frame.extend_from_slice(&[0; 9]);
        assert_eq!(decoder.decode(&frame, &[]), Outcome::NeedsMoreBytes(11));
    }

    #[test]
    fn response_missing_only_the_checksum_needs_more_bytes() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        let frame = [0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02, 0x2A];
        assert_eq!(decoder.decode(&frame, &[]), Outcome::NeedsMoreBytes(1));
    }

    #[test]
    fn response_with_piggybacked_next_frame() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        let mut bytes = vec![0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02, 0x2A, 0x32];
        bytes.extend_from_slice(&[0x01, 0x03]);
        assert_eq!(decoder.decode(&bytes, &[]), Outcome::HasTrailingBytes(2));
    }

    #[test]
    fn vendor_bug_accepts_short_frame_with_valid_checksum() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        let request = [0x2C, 0x03, 0x20, 0x06, 0x00, 0x2C, 0xA9, 0xAB];
        // Advertises 0x58 = 88 payload bytes, but the frame ends after 10
        // and the checksum over the short frame is valid.
        let answer = [
            0x2C, 0x03, 0x58, 0x45, 0x13, 0x80, 0x00, 0x45, 0x14, 0x00, 0x00, 0x45, 0x13, 0xCC,
            0x7D,
        ];
        assert_eq!(decoder.decode(&answer, &request), Outcome::Done);
        assert_eq!(decoder.direction(), Direction::Request);
    }

    #[test]
    fn short_frame_without_bug_fingerprint_keeps_waiting() {
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        // Same shape, but the previous request does not match the quirk.
        let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        let answer = [
            0x2C, 0x03, 0x58, 0x45, 0x13, 0x80, 0x00, 0x45, 0x14, 0x00, 0x00, 0x45, 0x13, 0xCC,
            0x7D,
        ];
        assert_eq!(decoder.decode(&answer, &request), Outcome::NeedsMoreBytes(76));
    }

    #[test]
    fn vendor_bug_requires_valid_checksum() {
        let request = [0x2C, 0x03, 0x20, 0x06, 0x00, 0x2C, 0xA9, 0xAB];
        let mut answer = [
            0x2C, 0x03, 0x58, 0x45, 0x13, 0x80, 0x00, 0x45, 0x14, 0x00, 0x00, 0x45, 0x13, 0xCC,
            0x7D,
        ];
        assert!(known_vendor_bug(&answer, &request));
        let mut decoder = empty_decoder();
        decoder.direction = Direction::Response;
        answer[13] = 0x00;
        assert_eq!(decoder.decode(&answer, &request), Outcome::NeedsMoreBytes(76));
    }

    mod rendering {
        use super::*;

        #[test]
        fn integers() {
            assert_eq!(render_value(DataType::U8, &[0xFF]), "{255}");
            assert_eq!(render_value(DataType::I8, &[0xFF]), "{-1}");
            assert_eq!(render_value(DataType::U16, &[0x00, 0x01]), "{1}");
            assert_eq!(render_value(DataType::I16, &[0xFF, 0xFE]), "{-2}");
            assert_eq!(
                render_value(DataType::U32, &[0x00, 0x01, 0x00, 0x00]),
                "{65536}"
            );
            assert_eq!(
                render_value(DataType::I32, &[0xFF, 0xFF, 0xFF, 0xFF]),
                "{-1}"
            );
        }

        #[test]
        fn float_from_big_endian_bit_pattern() {
            assert_eq!(
                render_value(DataType::F32, &[0x42, 0x2A, 0x00, 0x00]),
                "{42.5}"
            );
        }

        #[test]
        fn bit_and_bits() {
            assert_eq!(render_value(DataType::Bit, &[0x01, 0x00]), "1");
            assert_eq!(render_value(DataType::Bit, &[0x00, 0x00]), "0");
            // Bits are rendered LSB first per byte.
            assert_eq!(render_value(DataType::Bits, &[0b0000_0101]), "10100000");
            assert_eq!(
                render_value(DataType::Bits, &[0x01, 0x80]),
                "1000000000000001"
            );
        }

        #[test]
        fn dump_and_void() {
            assert_eq!(render_value(DataType::Dump, &[0xDE, 0xAD]), "DE AD");
            assert_eq!(render_value(DataType::Void, &[]), "");
        }

        #[test]
        fn window_too_short_for_datatype_dumps_hex() {
            assert_eq!(render_value(DataType::U32, &[0x12, 0x34]), "12 34");
            assert_eq!(render_value(DataType::U16, &[0x12]), "12");
        }

        #[test]
        fn register_length_overrunning_payload_is_clamped() {
            let registers: RegisterTable =
                [register(0x0000, 4, DataType::F32, "Oversized")].into_iter().collect();
            let mut decoder = Decoder::new(CommandTable::default(), registers);
            decoder.direction = Direction::Response;
            decoder.last_register = 0x0000;
            // Advertises 2 payload bytes, but the register wants 4.
            let frame = [0x01, 0x03, 0x02, 0x12, 0x34, 0xB5, 0x33];
            // The frame is still consumed and the direction flips; the CRC
            // verdict is the controller's business.
            assert_eq!(decoder.decode(&frame, &[]), Outcome::Done);
            assert_eq!(decoder.direction(), Direction::Request);
        }
    }
}

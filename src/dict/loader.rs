// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-oriented CSV loader for the definition files.
//!
//! The format is deliberately forgiving, matching what people keep in
//! hand-maintained dictionaries:
//!
//! - lines whose first non-whitespace character is `;` or `#` are comments,
//! - lines without any comma are warned about and skipped,
//! - integer fields accept decimal, octal (leading `0`) and `0x` hex,
//! - commas inside the trailing description are tolerated: surplus fields
//!   are glued back onto the description.
//!
//! Register records carry 9 fields:
//! `address, length, orientation, datatype, unit, factor, pref-unit, name, description`
//!
//! Command records carry 5 fields:
//! `function-code, name, max-at-once, min-max, description`
//!
//! A missing file is fatal; a malformed line only costs a warning.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use super::{CommandDef, CommandTable, DataType, RegisterDef, RegisterTable};
use crate::error::{Error, Result};

/// Loads the register dictionary from `path`.
pub fn load_registers(path: impl AsRef<Path>) -> Result<RegisterTable> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| Error::DefinitionFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(read_registers(BufReader::new(file)))
}

/// Loads the command dictionary from `path`.
pub fn load_commands(path: impl AsRef<Path>) -> Result<CommandTable> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| Error::DefinitionFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(read_commands(BufReader::new(file)))
}

/// Parses register definitions from any line-oriented reader.
pub fn read_registers(reader: impl BufRead) -> RegisterTable {
    parse_lines(reader, parse_register_line)
}

/// Parses command definitions from any line-oriented reader.
pub fn read_commands(reader: impl BufRead) -> CommandTable {
    parse_lines(reader, parse_command_line)
}

fn parse_lines<D, T>(reader: impl BufRead, parse: impl Fn(&str) -> ParseResult<D>) -> T
where
    T: Default + Extend<D>,
{
    let mut table = T::default();
    for (lineno, line) in reader.lines().enumerate() {
        let lineno = lineno + 1;
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("stopping at unreadable line #{lineno}: {err}");
                break;
            }
        };
        let line = line.trim();
        if line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if !line.contains(',') {
            log::warn!("invalid line #{lineno}: {line}");
            continue;
        }
        match parse(line) {
            Ok(def) => table.extend([def]),
            Err(reason) => log::warn!("invalid line #{lineno}, {reason}: {line}"),
        }
    }
    table
}

type ParseResult<T> = std::result::Result<T, String>;

fn parse_register_line(line: &str) -> ParseResult<RegisterDef> {
    let mut def = RegisterDef {
        address: 0,
        length: 0,
        orientation: String::new(),
        datatype: DataType::Void,
        unit: String::new(),
        factor: 0.0,
        preferred_unit: String::new(),
        name: String::new(),
        description: String::new(),
    };
    for (idx, raw) in line.split(',').enumerate() {
        let field = raw.trim();
        match idx {
            0 => def.address = parse_u16(field, "register address")?,
            1 => def.length = parse_u16(field, "length")?,
            2 => def.orientation = field.to_owned(),
            3 => {
                def.datatype = DataType::parse(field)
                    .ok_or_else(|| format!("unknown datatype \"{field}\""))?;
            }
            4 => def.unit = field.to_owned(),
            5 => {
                // An empty factor means "no conversion".
                def.factor = if field.is_empty() {
                    0.0
                } else {
                    field.parse().map_err(|_| {
                        format!("expecting floating point factor, got \"{field}\"")
                    })?
                };
            }
            6 => def.preferred_unit = field.to_owned(),
            7 => def.name = field.to_owned(),
            8 => def.description = field.to_owned(),
            // Freeform description text containing commas.
            _ => {
                def.description.push_str(", ");
                def.description.push_str(field);
            }
        }
    }
    Ok(def)
}

fn parse_command_line(line: &str) -> ParseResult<CommandDef> {
    let mut def = CommandDef {
        function_code: 0,
        name: String::new(),
        max_at_once: 0,
        min_address: 0,
        max_address: 0,
        description: String::new(),
    };
    for (idx, raw) in line.split(',').enumerate() {
        let field = raw.trim();
        match idx {
            0 => {
                let code = parse_int(field)
                    .ok_or_else(|| format!("expecting function code, got \"{field}\""))?;
                def.function_code = u8::try_from(code)
                    .map_err(|_| format!("function code out of range: {code}"))?;
            }
            1 => def.name = field.to_owned(),
            2 => def.max_at_once = parse_u16(field, "max-at-once")?,
            3 => {
                let mut parts = field.splitn(2, '-');
                if let Some(min) = parts.next() {
                    def.min_address = parse_u16(min.trim(), "range start")?;
                }
                if let Some(max) = parts.next() {
                    def.max_address = parse_u16(max.trim(), "range end")?;
                }
            }
            4 => def.description = field.to_owned(),
            _ => {
                def.description.push_str(", ");
                def.description.push_str(field);
            }
        }
    }
    Ok(def)
}

fn parse_u16(field: &str, what: &str) -> ParseResult<u16> {
    let value =
        parse_int(field).ok_or_else(|| format!("expecting integer {what}, got \"{field}\""))?;
    u16::try_from(value).map_err(|_| format!("{what} out of range: {value}"))
}

// Base-0 integer parsing: decimal, octal with a leading 0, hex with 0x.
fn parse_int(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

impl Extend<RegisterDef> for RegisterTable {
    fn extend<I: IntoIterator<Item = RegisterDef>>(&mut self, iter: I) {
        for def in iter {
            self.insert(def);
        }
    }
}

impl Extend<CommandDef> for CommandTable {
    fn extend<I: IntoIterator<Item = CommandDef>>(&mut self, iter: I) {
        for def in iter {
            self.insert(def);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_register_records() {
        let input = b"\
; power meter registers
# address, length, orientation, datatype, unit, factor, pref-unit, name, description
0x2000, 2, AB, uint16_t, V, 0.1, V, GridVoltage, grid voltage
8193, 4, ABCD, float, W, , kW, ActivePower, signed active power
" as &[u8];
        let table = read_registers(input);
        assert_eq!(table.len(), 2);

        let reg = table.get(0x2000).unwrap();
        assert_eq!(reg.length, 2);
        assert_eq!(reg.orientation, "AB");
        assert_eq!(reg.datatype, DataType::U16);
        assert_eq!(reg.unit, "V");
        assert_eq!(reg.factor, 0.1);
        assert_eq!(reg.name, "GridVoltage");

        let reg = table.get(8193).unwrap();
        assert_eq!(reg.datatype, DataType::F32);
        // An empty factor field means no conversion.
        assert_eq!(reg.factor, 0.0);
    }

    #[test]
    fn commas_in_description_are_tolerated() {
        let input =
            b"0x10, 2, AB, uint16_t, A, , A, Current, phase current, averaged, 1s window" as &[u8];
        let table = read_registers(input);
        assert_eq!(
            table.get(0x10).unwrap().description,
            "phase current, averaged, 1s window"
        );
    }

    #[test]
    fn octal_and_hex_addresses() {
        let input = b"010, 2, AB, uint16_t, , , , OctalReg, \n0x10, 2, AB, uint16_t, , , , HexReg, " as &[u8];
        let table = read_registers(input);
        assert_eq!(table.get(8).unwrap().name, "OctalReg");
        assert_eq!(table.get(16).unwrap().name, "HexReg");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = b"\
no comma in this line
0xFFFF1, 2, AB, uint16_t, , , , OutOfRange,
0x20, 2, AB, double, , , , BadType,
0x21, 2, AB, uint16_t, , not-a-number, , BadFactor,
0x22, 2, AB, uint16_t, , , , Good,
" as &[u8];
        let table = read_registers(input);
        assert_eq!(table.len(), 1);
        assert!(table.get(0x22).is_some());
    }

    #[test]
    fn read_command_records() {
        let input = b"\
; function codes
0x03, ReadHoldingRegisters, 125, 0x0000-0xFFFF, read holding registers
16, WriteMultipleRegisters, 123, 0-65535, write multiple registers
" as &[u8];
        let table = read_commands(input);
        assert_eq!(table.len(), 2);

        let cmd = table.get(0x03).unwrap();
        assert_eq!(cmd.name, "ReadHoldingRegisters");
        assert_eq!(cmd.max_at_once, 125);
        assert_eq!(cmd.min_address, 0x0000);
        assert_eq!(cmd.max_address, 0xFFFF);

        let cmd = table.get(0x10).unwrap();
        assert_eq!(cmd.max_address, 65535);
    }

    #[test]
    fn command_range_without_upper_bound() {
        let input = b"0x06, WriteSingleRegister, 1, 0, write one register" as &[u8];
        let table = read_commands(input);
        let cmd = table.get(0x06).unwrap();
        assert_eq!(cmd.min_address, 0);
        assert_eq!(cmd.max_address, 0);
    }

    #[test]
    fn loading_missing_file_fails() {
        let err = load_registers("/nonexistent/registers.csv").unwrap_err();
        assert!(matches!(err, crate::Error::DefinitionFile { .. }));
    }
}

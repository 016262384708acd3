// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Register and command dictionaries.
//!
//! Both dictionaries are loaded once at startup from CSV definition files
//! (see [`loader`]) and are never mutated afterwards. The decoder consults
//! them on every frame, so lookups go through plain hash maps.

use std::collections::HashMap;

pub mod loader;

/// Rendering type of a register value, resolved once at dictionary load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Renders nothing.
    Void,
    /// Raw hex dump of the register's bytes.
    Dump,
    /// A single boolean byte.
    Bit,
    /// Every bit of the register's bytes, LSB first.
    Bits,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    /// Parses a datatype tag from a definition file.
    ///
    /// Accepts both the C-style spellings used by existing dictionaries
    /// (`uint16_t`, `float`, …) and the short Rust-style ones.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let tag = match s {
            "void" => Self::Void,
            "dump" => Self::Dump,
            "bit" => Self::Bit,
            "bits" => Self::Bits,
            "uint8_t" | "u8" => Self::U8,
            "int8_t" | "i8" => Self::I8,
            "uint16_t" | "u16" => Self::U16,
            "int16_t" | "i16" => Self::I16,
            "uint32_t" | "u32" => Self::U32,
            "int32_t" | "i32" => Self::I32,
            "float" | "f32" => Self::F32,
            _ => return None,
        };
        Some(tag)
    }
}

/// Definition of a single register address.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDef {
    pub address: u16,
    /// Bytes this register occupies in a response payload. A plain Modbus
    /// register is one word, so usually 2.
    pub length: u16,
    /// Byte order of the raw value: `"AB"` is a big-endian word, `"ABCD"`
    /// a big-endian double word, `"DCBA"` little-endian and so on. Only
    /// the big-endian orders appear in dictionaries seen so far, and the
    /// decoder assembles values big-endian.
    pub orientation: String,
    pub datatype: DataType,
    /// Physical unit of the raw value.
    pub unit: String,
    /// Multiplier into [`preferred_unit`](Self::preferred_unit), 0.0 when
    /// no conversion applies.
    pub factor: f64,
    pub preferred_unit: String,
    pub name: String,
    pub description: String,
}

/// Definition of a Modbus function code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDef {
    pub function_code: u8,
    pub name: String,
    /// Upper bound of registers a single request may ask for.
    pub max_at_once: u16,
    pub min_address: u16,
    pub max_address: u16,
    pub description: String,
}

/// Register address → definition, immutable after load.
#[derive(Debug, Default)]
pub struct RegisterTable(HashMap<u16, RegisterDef>);

impl RegisterTable {
    #[must_use]
    pub fn get(&self, address: u16) -> Option<&RegisterDef> {
        self.0.get(&address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // The first definition of an address wins, duplicates further down the
    // file are ignored.
    fn insert(&mut self, def: RegisterDef) {
        self.0.entry(def.address).or_insert(def);
    }
}

impl FromIterator<RegisterDef> for RegisterTable {
    fn from_iter<I: IntoIterator<Item = RegisterDef>>(iter: I) -> Self {
        let mut table = Self::default();
        for def in iter {
            table.insert(def);
        }
        table
    }
}

/// Function code → definition, immutable after load.
#[derive(Debug, Default)]
pub struct CommandTable(HashMap<u8, CommandDef>);

impl CommandTable {
    #[must_use]
    pub fn get(&self, function_code: u8) -> Option<&CommandDef> {
        self.0.get(&function_code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, def: CommandDef) {
        self.0.entry(def.function_code).or_insert(def);
    }
}

impl FromIterator<CommandDef> for CommandTable {
    fn from_iter<I: IntoIterator<Item = CommandDef>>(iter: I) -> Self {
        let mut table = Self::default();
        for def in iter {
            table.insert(def);
        }
        table
    }
}

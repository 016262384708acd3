// SPDX-FileCopyrightText: Copyright (c) 2023-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serial port adapter.
//!
//! Opens the monitored port read-only for all practical purposes: the
//! sniffer never writes to the bus. The capture loop itself only needs an
//! [`AsyncRead`](tokio::io::AsyncRead), so everything port-specific stays
//! in here.

use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};

use crate::error::{Error, Result};

/// Line parameters of the monitored bus.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub path: String,
    pub baud_rate: u32,
    /// 5 to 8 data bits; anything else falls back to 8.
    pub data_bits: u8,
    /// `'N'`, `'E'` or `'O'`.
    pub parity: char,
    /// 1 or 2.
    pub stop_bits: u8,
    /// Ask the kernel for ASYNC_LOW_LATENCY on the UART (Linux only).
    /// FTDI-style adapters otherwise buffer far beyond the inter-frame gap.
    pub low_latency: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyAMA0".to_owned(),
            baud_rate: 9600,
            data_bits: 8,
            parity: 'N',
            stop_bits: 1,
            low_latency: false,
        }
    }
}

/// Serial line speeds the classic termios interface knows about.
const SUPPORTED_BAUD_RATES: [u32; 22] = [
    300, 600, 1200, 1800, 2400, 4800, 9600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800,
    500_000, 576_000, 921_600, 1_000_000, 1_152_000, 1_500_000, 2_000_000, 2_500_000, 3_000_000,
];

/// Opens and configures the port for listening.
pub fn open(config: &PortConfig) -> Result<SerialStream> {
    if !SUPPORTED_BAUD_RATES.contains(&config.baud_rate) {
        return Err(Error::BaudRate(config.baud_rate));
    }
    let builder = tokio_serial::new(config.path.as_str(), config.baud_rate)
        .data_bits(match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        })
        .parity(match config.parity {
            'E' | 'e' => Parity::Even,
            'O' | 'o' => Parity::Odd,
            _ => Parity::None,
        })
        .stop_bits(if config.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        })
        .flow_control(FlowControl::None);
    let stream = SerialStream::open(&builder).map_err(|source| Error::PortOpen {
        path: config.path.clone(),
        source,
    })?;
    if config.low_latency {
        set_low_latency(&stream);
    }
    Ok(stream)
}

/// Best effort: a kernel or adapter without the low latency flag only
/// costs a warning, the capture still works with a longer interval.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_low_latency(stream: &SerialStream) {
    use std::os::unix::io::AsRawFd as _;

    const TIOCGSERIAL: libc::c_ulong = 0x541E;
    const TIOCSSERIAL: libc::c_ulong = 0x541F;
    const ASYNC_LOW_LATENCY: libc::c_int = 0x2000;

    /// `struct serial_struct` from `<linux/serial.h>`.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SerialStruct {
        type_: libc::c_int,
        line: libc::c_int,
        port: libc::c_uint,
        irq: libc::c_int,
        flags: libc::c_int,
        xmit_fifo_size: libc::c_int,
        custom_divisor: libc::c_int,
        baud_base: libc::c_int,
        close_delay: libc::c_ushort,
        io_type: libc::c_char,
        reserved_char: [libc::c_char; 1],
        hub6: libc::c_int,
        closing_wait: libc::c_ushort,
        closing_wait2: libc::c_ushort,
        iomem_base: *mut libc::c_uchar,
        iomem_reg_shift: libc::c_ushort,
        port_high: libc::c_uint,
        iomap_base: libc::c_ulong,
    }

    let fd = stream.as_raw_fd();
    let mut serial: SerialStruct = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, TIOCGSERIAL, &mut serial) } < 0 {
        log::warn!(
            "low latency mode not supported: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    serial.flags |= ASYNC_LOW_LATENCY;
    if unsafe { libc::ioctl(fd, TIOCSSERIAL, &serial) } < 0 {
        log::warn!(
            "cannot enable low latency mode: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_low_latency(_stream: &SerialStream) {
    log::warn!("low latency mode is only available on Linux");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_baud_rate_is_rejected() {
        let config = PortConfig {
            baud_rate: 12_345,
            ..PortConfig::default()
        };
        assert!(matches!(open(&config), Err(Error::BaudRate(12_345))));
    }

    #[test]
    fn common_modbus_baud_rates_are_supported() {
        for baud in [9600, 19_200, 38_400, 115_200] {
            assert!(SUPPORTED_BAUD_RATES.contains(&baud));
        }
    }
}

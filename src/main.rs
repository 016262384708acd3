// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command line entry point.

use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::Parser;

use modbus_rtu_sniffer::{
    decoder::Decoder,
    dict::{loader, CommandTable, RegisterTable},
    pcap::{PcapWriter, DLT_USER0},
    serial::{self, PortConfig},
    sniffer::{Sniffer, SnifferConfig},
};

/// Passive Modbus RTU bus sniffer.
///
/// Listens on a serial port attached to the bus, decodes the observed
/// request/response traffic against optional register and command
/// dictionaries, and stores every well-formed frame in a pcap capture
/// file. SIGUSR1 starts a fresh capture file.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Serial port to listen on
    #[arg(short = 'p', long, default_value = "/dev/ttyAMA0")]
    serial_port: String,

    /// Capture file, `-` for stdout (truncated if already existing)
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Serial port speed
    #[arg(short, long, default_value_t = 9600)]
    speed: u32,

    /// Number of data bits (5-8)
    #[arg(short, long, default_value_t = 8)]
    bits: u8,

    /// Parity to use: N, E or O
    #[arg(short = 'P', long, default_value_t = 'N')]
    parity: char,

    /// Stop bits to use (1 or 2)
    #[arg(short = 'S', long, default_value_t = 1)]
    stop_bits: u8,

    /// Time interval between packets in microseconds
    #[arg(short = 't', long = "interval", default_value_t = 1500)]
    interval_us: u32,

    /// Also dump packets with broken checksums
    #[arg(short, long)]
    ignore_crc: bool,

    /// Maximum number of packets per capture file, 0 to never rotate
    #[arg(short, long, default_value_t = 10_000)]
    max_packets: u64,

    /// Try to enable serial port low-latency mode (Linux only)
    #[arg(short, long)]
    low_latency: bool,

    /// Definition file with Modbus register specifications
    #[arg(short = 'r', long)]
    registers_def: Option<PathBuf>,

    /// Definition file with Modbus command specifications
    #[arg(short = 'c', long)]
    commands_def: Option<PathBuf>,

    /// pcap link type recorded in the capture file
    #[arg(long, default_value_t = DLT_USER0)]
    link_type: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let cli = Cli::parse();

    log::info!("starting modbus sniffer");
    log::info!("output file: {}", cli.output);
    log::info!("serial port: {}", cli.serial_port);
    log::info!(
        "port type: {}{}{} {} baud",
        cli.bits,
        cli.parity,
        cli.stop_bits,
        cli.speed
    );
    log::info!("time interval: {} us", cli.interval_us);
    log::info!("maximum packets in capture: {}", cli.max_packets);

    let commands = match &cli.commands_def {
        Some(path) => {
            log::info!("reading command definition from: {}", path.display());
            loader::load_commands(path).context("reading command definitions")?
        }
        None => {
            log::info!("no command decoding wanted");
            CommandTable::default()
        }
    };
    let registers = match &cli.registers_def {
        Some(path) => {
            log::info!("reading register definition from: {}", path.display());
            loader::load_registers(path).context("reading register definitions")?
        }
        None => {
            log::info!("no register decoding wanted");
            RegisterTable::default()
        }
    };

    let writer = PcapWriter::create(&cli.output, cli.link_type)?;
    let port = serial::open(&PortConfig {
        path: cli.serial_port.clone(),
        baud_rate: cli.speed,
        data_bits: cli.bits,
        parity: cli.parity,
        stop_bits: cli.stop_bits,
        low_latency: cli.low_latency,
    })?;

    let mut sniffer = Sniffer::new(
        Decoder::new(commands, registers),
        writer,
        SnifferConfig {
            interval: Duration::from_micros(cli.interval_us.into()),
            ignore_crc: cli.ignore_crc,
            max_packets: cli.max_packets,
        },
    );

    #[cfg(unix)]
    spawn_rotate_handler(sniffer.rotate_flag());

    sniffer.run(port).await?;
    Ok(())
}

/// SIGUSR1 only sets a flag; the capture loop rotates at the next cycle.
#[cfg(unix)]
fn spawn_rotate_handler(flag: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    use std::sync::atomic::Ordering;

    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::user_defined1()) {
        Ok(mut stream) => {
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    log::info!("SIGUSR1 received, capture file rotation requested");
                    flag.store(true, Ordering::Relaxed);
                }
            });
        }
        Err(err) => log::warn!("cannot install SIGUSR1 handler: {err}"),
    }
}

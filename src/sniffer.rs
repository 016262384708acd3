// SPDX-FileCopyrightText: Copyright (c) 2023-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capture controller.
//!
//! Glues the frame segmenter, the decoder and the pcap sink together. The
//! whole capture runs as one sequential loop with a single suspension
//! point: the bounded wait on the serial byte source. The wait timeout is
//! the user-configured inter-byte interval, which doubles as the Modbus
//! RTU 3.5-character inter-frame gap heuristic. USB serial adapters
//! typically hand out 32-byte chunks no matter how the line idles, so the
//! gap heuristic is what actually cuts the stream into frames.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use smallvec::SmallVec;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _},
    time::timeout,
};

use crate::{
    crc,
    decoder::{hex_dump, Decoder, Outcome},
    error::{Error, Result},
    pcap::PcapWriter,
    MAX_FRAME_LEN,
};

/// Bounded direction-flip retries per byte string, so persistently
/// ambiguous bytes cannot livelock the loop.
const MAX_DIRECTION_RETRIES: u8 = 4;

type FrameBuf = SmallVec<[u8; MAX_FRAME_LEN]>;

/// Tuning knobs of the capture loop.
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Inter-byte read timeout. Too short cuts slow frames apart, too
    /// long glues consecutive frames together; nobody but the user knows
    /// the line speed, so this is not auto-tuned.
    pub interval: Duration,
    /// Also persist frames whose checksum does not validate.
    pub ignore_crc: bool,
    /// Rotate the capture file after this many accepted frames,
    /// 0 disables count-based rotation.
    pub max_packets: u64,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(1500),
            ignore_crc: false,
            max_packets: 10_000,
        }
    }
}

/// Running capture statistics, reported when the capture ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub bytes_read: u64,
    pub frames_accepted: u64,
    pub crc_failures: u64,
    pub shortest_frame: Option<usize>,
    pub longest_frame: Option<usize>,
    frame_len_total: u64,
    pub shortest_gap: Option<Duration>,
    pub longest_gap: Option<Duration>,
    gap_total: Duration,
    gap_count: u32,
}

impl Stats {
    fn record_frame(&mut self, len: usize) {
        self.frames_accepted += 1;
        self.frame_len_total += len as u64;
        self.shortest_frame = Some(self.shortest_frame.map_or(len, |min| min.min(len)));
        self.longest_frame = Some(self.longest_frame.map_or(len, |max| max.max(len)));
    }

    fn record_gap(&mut self, gap: Duration) {
        self.gap_count += 1;
        self.gap_total += gap;
        self.shortest_gap = Some(self.shortest_gap.map_or(gap, |min| min.min(gap)));
        self.longest_gap = Some(self.longest_gap.map_or(gap, |max| max.max(gap)));
    }

    #[must_use]
    pub fn mean_frame_len(&self) -> Option<u64> {
        (self.frames_accepted > 0).then(|| self.frame_len_total / self.frames_accepted)
    }

    #[must_use]
    pub fn mean_gap(&self) -> Option<Duration> {
        (self.gap_count > 0).then(|| self.gap_total / self.gap_count)
    }
}

/// The capture loop: segmenter, decoder feedback, CRC policing and
/// persistence.
#[derive(Debug)]
pub struct Sniffer {
    decoder: Decoder,
    writer: PcapWriter,
    config: SnifferConfig,
    rotate_log: Arc<AtomicBool>,
    accu: FrameBuf,
    /// Copy of the most recent CRC-valid frame, feeds the vendor-bug
    /// fingerprint of the decoder.
    prev_frame: FrameBuf,
    retries: u8,
    /// Accumulator length of the last starved decode attempt. Gates
    /// decoder re-entry until new bytes arrive.
    starved_at: Option<usize>,
    chunk_seq: u64,
    last_accept_at: Option<Instant>,
    stats: Stats,
}

impl Sniffer {
    #[must_use]
    pub fn new(decoder: Decoder, writer: PcapWriter, config: SnifferConfig) -> Self {
        Self {
            decoder,
            writer,
            config,
            rotate_log: Arc::new(AtomicBool::new(false)),
            accu: FrameBuf::new(),
            prev_frame: FrameBuf::new(),
            retries: 0,
            starved_at: None,
            chunk_seq: 0,
            last_accept_at: None,
            stats: Stats::default(),
        }
    }

    /// Shared rotation flag, observed at the top of every cycle.
    ///
    /// Anything may set it; the usual source is a SIGUSR1 handler. The
    /// controller performs the rotation synchronously and clears the flag.
    #[must_use]
    pub fn rotate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.rotate_log)
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Runs the capture until the byte source reports EOF.
    ///
    /// Every other termination is an error: reads failing for reasons
    /// other than the inter-frame timeout, and any capture write failure.
    pub async fn run<R>(&mut self, mut port: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; MAX_FRAME_LEN];
        loop {
            if self.rotate_log.swap(false, Ordering::Relaxed) {
                self.writer.rotate()?;
            }
            let free = MAX_FRAME_LEN - self.accu.len();
            if free == 0 {
                // A full accumulator is processed before reading on.
                self.drain_accumulator(false)?;
                if self.accu.len() == MAX_FRAME_LEN {
                    // No advertised length can exceed a full accumulator;
                    // drop the bytes rather than spin on them.
                    log::error!("a full accumulator did not decode, dropping {MAX_FRAME_LEN} bytes");
                    self.accu.clear();
                    self.starved_at = None;
                }
                continue;
            }
            match timeout(self.config.interval, port.read(&mut chunk[..free])).await {
                Ok(Ok(0)) => {
                    // EOF on the byte source.
                    if !self.accu.is_empty() {
                        self.drain_accumulator(true)?;
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    self.accu.extend_from_slice(&chunk[..n]);
                    self.stats.bytes_read += n as u64;
                    if self.accu.len() >= MAX_FRAME_LEN {
                        self.drain_accumulator(false)?;
                    }
                }
                Ok(Err(err)) => return Err(Error::PortRead(err)),
                // The line went idle for a full inter-frame gap.
                Err(_elapsed) => {
                    if !self.accu.is_empty() {
                        self.drain_accumulator(false)?;
                    }
                }
            }
        }
        self.log_stats();
        Ok(())
    }

    /// Decodes the accumulator contents, possibly several piggybacked
    /// frames deep, and feeds accepted frames to the sink.
    fn drain_accumulator(&mut self, at_eof: bool) -> Result<()> {
        // Re-entering the decoder without new bytes cannot make progress.
        if !at_eof && self.starved_at == Some(self.accu.len()) {
            log::debug!("still waiting on more data");
            return Ok(());
        }
        self.starved_at = None;

        self.chunk_seq += 1;
        log::debug!(
            "captured chunk {}: length = {}",
            self.chunk_seq,
            self.accu.len()
        );
        log::debug!("READ: {}", hex_dump(&self.accu));

        loop {
            match self.decoder.decode(&self.accu, &self.prev_frame) {
                Outcome::NeedsMoreBytes(missing) => {
                    if at_eof {
                        log::warn!(
                            "dropping {} bytes of an incomplete frame at end of capture",
                            self.accu.len()
                        );
                    } else {
                        log::debug!(
                            "incomplete frame: need {missing} more bytes, have {}",
                            self.accu.len()
                        );
                        self.starved_at = Some(self.accu.len());
                    }
                    return Ok(());
                }
                Outcome::DirectionWrong => {
                    if self.retries < MAX_DIRECTION_RETRIES {
                        self.retries += 1;
                        self.decoder.flip_direction();
                        log::debug!(
                            "direction mismatch, retry {} decoding as {:?}",
                            self.retries,
                            self.decoder.direction()
                        );
                        continue;
                    }
                    // Retries exhausted: accept the bytes as they are so
                    // the capture does not stall on them.
                    self.retries = 0;
                    self.accept_frame(self.accu.len())?;
                    self.accu.clear();
                    return Ok(());
                }
                Outcome::Done => {
                    self.retries = 0;
                    self.accept_frame(self.accu.len())?;
                    self.accu.clear();
                    return Ok(());
                }
                Outcome::HasTrailingBytes(remaining) => {
                    self.retries = 0;
                    let eaten = self.accu.len() - remaining;
                    self.accept_frame(eaten)?;
                    log::debug!("{remaining} trailing bytes move to the buffer start");
                    self.accu.copy_within(eaten.., 0);
                    self.accu.truncate(remaining);
                    // The trailing bytes may already hold the next
                    // complete frame.
                }
            }
        }
    }

    /// CRC verdict, previous-frame snapshot, persistence and bookkeeping
    /// for one decoded frame of `eaten` bytes.
    fn accept_frame(&mut self, eaten: usize) -> Result<()> {
        let frame = &self.accu[..eaten];
        let crc_ok = crc::check_frame(frame);
        if eaten >= 2 {
            log::info!(
                "CRC: {:04X} = {:02X}{:02X} [{}]",
                crc::crc16(&frame[..eaten - 2]),
                frame[eaten - 1],
                frame[eaten - 2],
                if crc_ok { "OK" } else { "FAIL" }
            );
        } else {
            log::info!("CRC: frame too short [FAIL]");
        }

        if crc_ok {
            self.prev_frame.clear();
            self.prev_frame.extend_from_slice(frame);
        } else {
            self.stats.crc_failures += 1;
        }

        if crc_ok || self.config.ignore_crc {
            log::debug!("DONE: {}", hex_dump(frame));
            if eaten < self.accu.len() {
                log::debug!("NEXT: {}", hex_dump(&self.accu[eaten..]));
            }
            self.writer.write_packet(frame)?;
            self.stats.record_frame(eaten);
            let now = Instant::now();
            if let Some(previous) = self.last_accept_at.replace(now) {
                self.stats.record_gap(now - previous);
            }
            if self.config.max_packets > 0
                && self.stats.frames_accepted % self.config.max_packets == 0
            {
                self.rotate_log.store(true, Ordering::Relaxed);
            }
        } else {
            log::warn!("dropping {eaten} bytes with invalid checksum");
        }
        Ok(())
    }

    fn log_stats(&self) {
        let stats = &self.stats;
        log::info!(
            "capture finished: {} bytes read, {} frames accepted, {} CRC failures",
            stats.bytes_read,
            stats.frames_accepted,
            stats.crc_failures
        );
        if let (Some(shortest), Some(longest), Some(mean)) = (
            stats.shortest_frame,
            stats.longest_frame,
            stats.mean_frame_len(),
        ) {
            log::info!("frame length: min {shortest}, max {longest}, mean {mean}");
        }
        if let (Some(shortest), Some(longest), Some(mean)) =
            (stats.shortest_gap, stats.longest_gap, stats.mean_gap())
        {
            log::info!("frame spacing: min {shortest:?}, max {longest:?}, mean {mean:?}");
        }
    }
}

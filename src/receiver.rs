// Copyright (C) 2021 The rtp-ingest Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet-level receiving: parse, validate, re-frame, and order RTP packets.
//!
//! [`RtpReceiver::handle_rtp`] accepts one raw packet at a time, as emitted
//! by [`crate::RtpSplitter`]. Packets starting with the JT/T 1078 magic take
//! the JT1078 parse; everything else is treated as generic RTP per
//! [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550). Accepted
//! packets are rewritten into the canonical interleaved form and queued on
//! the track's [`PacketSortor`], which delivers them to the sink in sequence
//! order.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};
use pretty_hex::PrettyHex;

use crate::error::Error;
use crate::pool::PacketPool;
use crate::sort::PacketSortor;
use crate::splitter::JT1078_MAGIC;
use crate::{RtpPacket, TrackKind, MAX_TRACK};

/// Largest raw packet the receiver will accept.
const RTP_MAX_SIZE: usize = 10 * 1024;

/// Consecutive SSRC mismatches tolerated before a track treats the new SSRC
/// as a stream re-origination.
const SSRC_MAX_ERR: u32 = 10;

struct TrackContext {
    /// 0 means no SSRC remembered yet: the next packet's is adopted.
    expected_ssrc: u32,
    ssrc_err_count: u32,
    sorter: PacketSortor<RtpPacket>,
}

/// Parses, validates, and re-frames the packets of one connection.
///
/// One receiver owns the state of [`MAX_TRACK`] tracks. Accepted packets
/// pass through each track's [`PacketSortor`] and reach the sink given to
/// [`RtpReceiver::new`] as `(packet, track_index)` in sequence order.
///
/// A receiver belongs to the I/O driver of one connection and must only be
/// used from it; it holds no locks and spawns nothing.
pub struct RtpReceiver {
    tracks: Vec<TrackContext>,
    pool: PacketPool,
}

impl RtpReceiver {
    pub fn new<F: FnMut(RtpPacket, usize) + 'static>(on_sorted: F) -> Self {
        let on_sorted: Rc<RefCell<dyn FnMut(RtpPacket, usize)>> = Rc::new(RefCell::new(on_sorted));
        let mut tracks = Vec::with_capacity(MAX_TRACK);
        for index in 0..MAX_TRACK {
            let sink = on_sorted.clone();
            let mut sorter = PacketSortor::new();
            sorter.set_on_sort(Box::new(move |_seq, packet| {
                (&mut *sink.borrow_mut())(packet, index)
            }));
            tracks.push(TrackContext {
                expected_ssrc: 0,
                ssrc_err_count: 0,
                sorter,
            });
        }
        Self {
            tracks,
            pool: PacketPool::new(),
        }
    }

    /// Handles one raw packet on `track_index`.
    ///
    /// Returns `Ok(true)` if the packet was accepted and queued for sorting,
    /// `Ok(false)` if it was dropped (too small, oversized, no payload,
    /// missing clock, wrong SSRC, or a JT1078 reject). `Err` is returned
    /// only for a generic-path packet whose version field isn't 2, which is
    /// fatal to the connection. A reject leaves all track state untouched.
    ///
    /// # Panics
    ///
    /// Panics if `track_index >= MAX_TRACK`.
    pub fn handle_rtp(
        &mut self,
        track_index: usize,
        kind: TrackKind,
        sample_rate: u32,
        raw: &[u8],
    ) -> Result<bool, Error> {
        assert!(track_index < MAX_TRACK);
        if raw.len() < 12 {
            warn!("rtp packet too small: {} bytes", raw.len());
            return Ok(false);
        }
        if raw.starts_with(&JT1078_MAGIC) {
            return Ok(self.handle_jt1078(track_index, kind, sample_rate, raw));
        }
        self.handle_generic(track_index, kind, sample_rate, raw)
    }

    fn handle_generic(
        &mut self,
        track_index: usize,
        kind: TrackKind,
        sample_rate: u32,
        raw: &[u8],
    ) -> Result<bool, Error> {
        let version = raw[0] >> 6;
        if version != 2 {
            return Err(Error::InvalidRtpVersion {
                track: track_index,
                version,
            });
        }
        let ext = raw[0] & 0x10 != 0;
        let csrc = usize::from(raw[0] & 0x0f);

        // Strip padding: the last byte counts the trailing padding bytes,
        // and byte 0 goes out with the padding flag cleared.
        let mut first_byte = raw[0];
        let mut len = raw.len();
        if raw[0] & 0x20 != 0 {
            let padding = usize::from(raw[len - 1]);
            first_byte &= !0x20;
            len = len.saturating_sub(padding);
        }

        let mark = raw[1] >> 7 != 0;
        let payload_type = raw[1] & 0x7f;
        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let timestamp = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ssrc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        // Offset of the codec payload within the canonical packet; the
        // 4-byte interleaved header counts.
        let mut payload_offset = 12 + 4 + 4 * csrc;
        if ext && len >= payload_offset {
            // RFC 3550 header extension length, in 32-bit words after the
            // 4-byte extension header.
            let words = usize::from(u16::from_be_bytes([
                raw[payload_offset - 2],
                raw[payload_offset - 1],
            ]));
            payload_offset += (words + 1) << 2;
        }

        if len + 4 <= payload_offset {
            warn!("rtp packet with no payload: {} <= {}", len, payload_offset);
            return Ok(false);
        }
        if len > RTP_MAX_SIZE {
            warn!("oversized rtp packet: {} > {}", len, RTP_MAX_SIZE);
            return Ok(false);
        }
        if sample_rate == 0 {
            // Can't convert the timestamp without a clock.
            debug!("no sample rate on track {}; dropping packet", track_index);
            return Ok(false);
        }
        let timestamp_ms = u64::from(timestamp) * 1000 / u64::from(sample_rate);

        if !self.check_ssrc(track_index, ssrc) {
            return Ok(false);
        }

        let interleaved = kind.interleaved();
        let mut data = self.pool.obtain(len + 4);
        data.extend_from_slice(&[b'$', interleaved, (len >> 8) as u8, (len & 0xff) as u8]);
        data.extend_from_slice(&raw[..len]);
        data[4] = first_byte;

        let packet = RtpPacket {
            kind,
            interleaved,
            mark,
            payload_type,
            sequence,
            timestamp_ms,
            ssrc,
            payload_offset,
            data,
        };
        self.tracks[track_index].sorter.sort_packet(sequence, packet);
        Ok(true)
    }

    fn handle_jt1078(
        &mut self,
        track_index: usize,
        kind: TrackKind,
        sample_rate: u32,
        raw: &[u8],
    ) -> bool {
        // V/P/X/CC. Anything but version 2, no padding, no extension, and
        // exactly one CSRC is not a JT1078 media packet.
        let flags = raw[4];
        let version = flags >> 6;
        let padding = (flags >> 5) & 0x01;
        let ext = flags & 0x10;
        let csrc = flags & 0x0f;
        if !(version == 2 && padding == 0 && ext == 0 && csrc == 1) {
            debug!("ignoring packet with non-jt1078 flags {:02x}", flags);
            return false;
        }
        if raw.len() < 16 {
            debug!("jt1078 packet too short: {} bytes", raw.len());
            return false;
        }
        let data_type = raw[15] >> 4;
        // Pass-through data: nothing for the media pipeline.
        if data_type == 0b0100 {
            return false;
        }
        // Audio omits the two frame-interval fields.
        let length_offset = if data_type == 0b0011 { 24 } else { 28 };
        if raw.len() <= length_offset + 2 {
            warn!(
                "jt1078 packet with no payload: {} <= {}",
                raw.len(),
                length_offset + 2
            );
            return false;
        }
        let body_len = usize::from(u16::from_be_bytes([
            raw[length_offset],
            raw[length_offset + 1],
        ]));
        // The body starts with a 4-byte 00 00 00 01 separator, skipped in
        // the canonical copy.
        if body_len <= 4 || raw.len() < length_offset + 2 + body_len {
            warn!(
                "jt1078 packet with no payload: body {} bytes, raw {}:\n{:?}",
                body_len,
                raw.len(),
                raw.hex_dump()
            );
            return false;
        }
        if raw.len() > RTP_MAX_SIZE {
            warn!("oversized rtp packet: {} > {}", raw.len(), RTP_MAX_SIZE);
            return false;
        }
        if sample_rate == 0 {
            debug!("no sample rate on track {}; dropping packet", track_index);
            return false;
        }

        let mark = raw[5] >> 7 != 0;
        let payload_type = raw[5] & 0x7f;
        let sequence = u16::from_be_bytes([raw[6], raw[7]]);

        // The 8-byte timestamp is wrapped at 1e9 before the millisecond
        // conversion.
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[16..24]);
        let timestamp = u64::from_be_bytes(ts) % 1_000_000_000;
        let timestamp_ms = timestamp * 1000 / u64::from(sample_rate);

        // The SIM number stands in for the SSRC: rendered as hex digits and
        // read back as a decimal number, it fits u32 after mod 1e9.
        let sim = bcd_code(&raw[8..14]);
        let ssrc = (decimal_prefix(&sim) % 1_000_000_000) as u32;

        if !self.check_ssrc(track_index, ssrc) {
            return false;
        }

        let interleaved = kind.interleaved();
        let copy_len = body_len - 4;
        let mut data = self.pool.obtain(copy_len + 4);
        data.extend_from_slice(&[
            b'$',
            interleaved,
            (copy_len >> 8) as u8,
            (copy_len & 0xff) as u8,
        ]);
        data.extend_from_slice(&raw[length_offset + 6..length_offset + 6 + copy_len]);

        let packet = RtpPacket {
            kind,
            interleaved,
            mark,
            payload_type,
            sequence,
            timestamp_ms,
            ssrc,
            payload_offset: 4,
            data,
        };
        self.tracks[track_index].sorter.sort_packet(sequence, packet);
        true
    }

    /// Applies the per-track SSRC discipline: first packet adopts, matches
    /// reset the mismatch counter, mismatches reject. More than
    /// [`SSRC_MAX_ERR`] consecutive mismatches count as a stream
    /// re-origination: the track's buffer is dropped and the new SSRC
    /// adopted, though the triggering packet is still rejected.
    fn check_ssrc(&mut self, track_index: usize, ssrc: u32) -> bool {
        let track = &mut self.tracks[track_index];
        if track.expected_ssrc == 0 {
            track.expected_ssrc = ssrc;
        } else if track.expected_ssrc != ssrc {
            warn!(
                "wrong ssrc on track {}: {:08x} != {:08x}",
                track_index, ssrc, track.expected_ssrc
            );
            track.ssrc_err_count += 1;
            if track.ssrc_err_count > SSRC_MAX_ERR {
                warn!(
                    "ssrc changed on track {}: {:08x} -> {:08x}",
                    track_index, track.expected_ssrc, ssrc
                );
                track.sorter.clear();
                track.expected_ssrc = ssrc;
                track.ssrc_err_count = 0;
            }
            return false;
        }
        track.ssrc_err_count = 0;
        true
    }

    /// Forgets all per-track state: remembered SSRCs, mismatch counters,
    /// and buffered packets.
    pub fn clear(&mut self) {
        for track in &mut self.tracks {
            track.expected_ssrc = 0;
            track.ssrc_err_count = 0;
            track.sorter.clear();
        }
    }

    /// Caps the number of pooled packet buffers.
    pub fn set_pool_size(&mut self, size: usize) {
        self.pool.set_size(size);
    }

    /// Current depth of the track's reorder buffer.
    pub fn jitter_size(&self, track_index: usize) -> usize {
        self.tracks[track_index].sorter.jitter_size()
    }

    /// Number of 16-bit sequence wraps observed on the track.
    pub fn cycle_count(&self, track_index: usize) -> usize {
        self.tracks[track_index].sorter.cycle_count()
    }

    /// Returns a packet's buffer to the pool once downstream is done with
    /// it.
    pub fn recycle(&mut self, packet: RtpPacket) {
        self.pool.recycle(packet.data);
    }
}

/// Renders BCD bytes as their hex digits.
fn bcd_code(data: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        out.push(DIGITS[usize::from(b >> 4)] as char);
        out.push(DIGITS[usize::from(b & 0x0f)] as char);
    }
    out
}

/// Parses the longest leading run of decimal digits, `atoi`-style. A SIM
/// with out-of-range BCD nibbles renders as `a`..`f` and ends the run.
fn decimal_prefix(s: &str) -> u64 {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().unwrap_or(0)
}

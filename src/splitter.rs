// Copyright (C) 2021 The rtp-ingest Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-stream framing: finds packet boundaries in raw RTP-family streams.
//!
//! Three framings share one splitter. Generic RTP over TCP carries a
//! big-endian length, either bare or behind a `$ channel len_hi len_lo`
//! interleaved header. EHOME prefixes a 256-byte private header before an
//! interleaved-style packet. JT/T 1078 packets carry no length at all and
//! are delimited by the next occurrence of their magic.

use bytes::{Buf, BytesMut};
use log::debug;
use tokio_util::codec::Decoder;

const EHOME_MAGIC: [u8; 4] = [0x01, 0x00, 0x01, 0x00];
pub(crate) const JT1078_MAGIC: [u8; 4] = [0x30, 0x31, 0x63, 0x64];

/// Length of the EHOME private header preceding each packet.
const EHOME_HEADER_LEN: usize = 256;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Variant {
    Unknown,

    /// 256-byte private header, then an interleaved-style packet.
    Ehome,

    /// `$ channel len_hi len_lo` interleaved header.
    Interleaved,

    /// Bare big-endian u16 length prefix.
    LengthPrefixed,

    /// Magic-delimited JT/T 1078 packets.
    Jt1078,
}

/// Splits a raw byte stream into RTP-family packets.
///
/// The framing variant is detected once, from the first packet's magic
/// bytes, and is then sticky for the life of the connection. A
/// mis-identified stream surfaces as parse failures downstream, never as a
/// framing error: the only way the splitter "fails" is by asking for more
/// data.
#[derive(Debug)]
pub struct RtpSplitter {
    variant: Variant,

    /// Bytes to strip from the front of each complete packet.
    offset: usize,
}

impl Default for RtpSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpSplitter {
    pub fn new() -> Self {
        Self {
            variant: Variant::Unknown,
            offset: 0,
        }
    }

    /// Finds the end of the next complete packet in `data`, returning the
    /// offset one past its last byte, or `None` if more bytes are needed.
    ///
    /// Callers keep their unconsumed bytes and retry once more arrive; no
    /// byte is consumed by a `None` return.
    pub fn search_packet_tail(&mut self, data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        if self.variant == Variant::Unknown {
            self.detect(data)?;
        }
        match self.variant {
            Variant::Ehome => {
                if data.len() < EHOME_HEADER_LEN + 4 {
                    return None;
                }
                // The embedded interleaved header's length field sits two
                // bytes past the private header.
                find_tail_prefixed(&data[EHOME_HEADER_LEN + 2..])
                    .map(|end| EHOME_HEADER_LEN + 2 + end)
            }
            Variant::Interleaved => find_tail_prefixed(&data[2..]).map(|end| 2 + end),
            Variant::LengthPrefixed => find_tail_prefixed(data),
            Variant::Jt1078 => find_tail_jt1078(data),
            Variant::Unknown => unreachable!(),
        }
    }

    /// Prepares a complete packet (as delimited by
    /// [`RtpSplitter::search_packet_tail`]) for the receiver: strips the
    /// framing prefix and repairs the stray `\r` some EHOME encoders inject
    /// at byte 12, which misaligns the RTP header by one.
    pub fn on_recv_header<'a>(&self, packet: &'a mut [u8]) -> &'a mut [u8] {
        let offset = self.offset.min(packet.len());
        let mut data = &mut packet[offset..];
        if self.variant == Variant::Ehome && data.len() > 12 && data[12] == b'\r' {
            data.copy_within(0..12, 1);
            data = &mut data[1..];
        }
        data
    }

    /// First-packet variant detection. The sticky variant and per-packet
    /// strip offset are committed only once the variant's minimum length is
    /// in the buffer; a shorter buffer leaves the splitter undetected for
    /// the next call.
    fn detect(&mut self, data: &[u8]) -> Option<()> {
        if data[..4] == EHOME_MAGIC {
            if data.len() < EHOME_HEADER_LEN + 4 {
                return None;
            }
            // The strip covers the private header plus the embedded
            // 4-byte interleaved header.
            self.offset = EHOME_HEADER_LEN + 4;
            self.variant = Variant::Ehome;
        } else if data[0] == b'$' {
            self.offset = 4;
            self.variant = Variant::Interleaved;
        } else if data[..4] == JT1078_MAGIC {
            if data.len() < 26 {
                return None;
            }
            self.offset = 0;
            self.variant = Variant::Jt1078;
        } else {
            self.offset = 2;
            self.variant = Variant::LengthPrefixed;
        }
        debug!("detected {:?} framing", self.variant);
        Some(())
    }
}

/// Tail of a length-prefixed packet: a big-endian u16 length followed by
/// that many bytes.
fn find_tail_prefixed(data: &[u8]) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if data.len() < length + 2 {
        return None;
    }
    Some(2 + length)
}

/// Tail of a JT1078 packet: the byte before the next magic. The scan starts
/// at byte 4 to skip this packet's own magic.
fn find_tail_jt1078(data: &[u8]) -> Option<usize> {
    // A second magic needs at least 8 bytes.
    if data.len() < 8 {
        return None;
    }
    data[4..]
        .windows(JT1078_MAGIC.len())
        .position(|w| w == JT1078_MAGIC)
        .map(|i| 4 + i)
}

/// Drives the splitter from a `Framed` byte stream. Each decoded item is
/// one complete packet with the framing prefix stripped and the EHOME
/// fix-up applied, ready for [`crate::RtpReceiver::handle_rtp`].
impl Decoder for RtpSplitter {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let end = match self.search_packet_tail(&src[..]) {
            Some(end) => end,
            None => return Ok(None),
        };
        let mut packet = src.split_to(end);
        let trimmed = {
            let total = packet.len();
            total - self.on_recv_header(&mut packet[..]).len()
        };
        packet.advance(trimmed);
        Ok(Some(packet))
    }
}

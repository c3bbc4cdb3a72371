// Copyright (C) 2021 The rtp-ingest Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP stream ingestion for media servers.
//!
//! Splits a raw incoming byte stream into discrete RTP-family packets
//! ([`RtpSplitter`]), then parses, validates, and re-frames each packet into
//! a canonical interleaved form ([`RtpReceiver`]). Three wire framings are
//! understood and told apart by their magic bytes: plain TCP-interleaved RTP
//! (`$`-prefixed or bare length-prefixed), the EHOME vendor framing (a
//! 256-byte private header before each packet), and JT/T 1078 vehicle video
//! (magic-delimited packets carrying a SIM identity).
//!
//! Accepted packets flow through a per-track [`PacketSortor`], which hands
//! them to the caller in sequence order. Depacketisation into codec frames
//! is the caller's business; RTCP, SRTP, and retransmission are out of
//! scope.

pub mod error;
mod pool;
pub mod receiver;
pub mod sort;
pub mod splitter;

pub use error::Error;
pub use receiver::RtpReceiver;
pub use sort::PacketSortor;
pub use splitter::RtpSplitter;

use bytes::BytesMut;
use pretty_hex::PrettyHex;

/// Number of tracks a connection can carry: one video and one audio.
pub const MAX_TRACK: usize = 2;

/// The media kind of a track.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrackKind {
    Video = 0,
    Audio = 1,
}

impl TrackKind {
    /// The RTP data sub-channel carried in the canonical interleaved
    /// header; the matching RTCP sub-channel would be one higher.
    #[inline]
    pub fn interleaved(self) -> u8 {
        (self as u8) * 2
    }
}

/// A canonically re-framed RTP packet, as delivered to the per-track sorter.
///
/// `data` always starts with the 4-byte interleaved header
/// `[b'$', interleaved, len_hi, len_lo]`, where the length covers everything
/// after those four bytes.
pub struct RtpPacket {
    pub kind: TrackKind,
    pub interleaved: u8,
    pub mark: bool,
    pub payload_type: u8,
    pub sequence: u16,

    /// Media timestamp already converted to milliseconds.
    pub timestamp_ms: u64,

    /// Synchronisation source: the header SSRC on the generic path, the
    /// SIM-derived identity on the JT1078 path.
    pub ssrc: u32,

    /// Offset into `data` at which the codec payload begins. At least 4.
    pub payload_offset: usize,

    pub data: BytesMut,
}

impl RtpPacket {
    /// The re-framed packet body after the 4-byte interleaved header.
    #[inline]
    pub fn inner(&self) -> &[u8] {
        &self.data[4..]
    }

    /// The codec payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..]
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("kind", &self.kind)
            .field("interleaved", &self.interleaved)
            .field("mark", &self.mark)
            .field("payload_type", &self.payload_type)
            .field("sequence", &self.sequence)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("ssrc", &self.ssrc)
            .field("payload_offset", &self.payload_offset)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_channels() {
        assert_eq!(TrackKind::Video.interleaved(), 0);
        assert_eq!(TrackKind::Audio.interleaved(), 2);
    }
}

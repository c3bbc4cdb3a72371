// Copyright (C) 2021 The rtp-ingest Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection-fatal ingestion errors.
//!
//! Per-packet problems (oversized, no payload, missing clock, wrong SSRC,
//! malformed JT1078 flags) are not errors: [`crate::RtpReceiver::handle_rtp`]
//! reports them by returning `Ok(false)` and the connection stays usable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The generic RTP path saw a header whose version field isn't 2. The
    /// stream is not RTP at all; the connection should be torn down.
    #[error("corrupt RTP on track {track}: version {version}, expected 2")]
    InvalidRtpVersion { track: usize, version: u8 },
}

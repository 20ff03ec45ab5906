//! Datagram framing: length prefix, bucket padding, timestamp jitter.
//!
//! Every outbound payload is prefixed with its 4-byte big-endian
//! length and zero-padded to the next 256-byte boundary, so every
//! datagram on the wire is a whole number of buckets regardless of
//! what it carries. Unpadding trusts the length prefix only; trailing
//! zeros are never scanned.

use rand::Rng;

use crate::error::Fault;

/// Padding bucket size. Every wire datagram is a multiple of this.
pub const BUCKET: usize = 256;

/// Outbound plaintext timestamps move by up to this much either way.
pub const JITTER_MS: i64 = 250;

/// Cover-traffic cadence on every verified session.
pub const KEEPALIVE_PERIOD_MS: u64 = 2_000;

/// Upper bound on a declared payload length. Generous enough for a
/// base64-encoded 1 MiB file chunk envelope, small enough to stop a
/// hostile length prefix from pinning the buffer.
const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Length-prefix and zero-pad one payload to the bucket boundary.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, Fault> {
    if payload.is_empty() {
        return Err(Fault::Codec("refusing to frame an empty payload".into()));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Fault::Codec(format!(
            "payload of {} bytes exceeds the frame limit",
            payload.len()
        )));
    }
    let total = padded_len(payload.len());
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.resize(total, 0);
    Ok(frame)
}

/// Whole-frame size for a payload: prefix + payload, rounded up to
/// the next bucket.
pub fn padded_len(payload_len: usize) -> usize {
    (LEN_PREFIX + payload_len).div_ceil(BUCKET) * BUCKET
}

/// Incremental splitter for the inbound byte stream. Feed it whatever
/// the socket produced; it yields complete payloads and discards the
/// padding between them.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Fault> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(Fault::Codec("frame with zero-length payload".into()));
        }
        if len > MAX_PAYLOAD_LEN {
            return Err(Fault::Codec(format!(
                "frame declares {len} bytes, over the limit"
            )));
        }
        let total = padded_len(len);
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }

    /// Call at end of stream: leftover bytes mean the peer closed
    /// mid-frame, or the length prefix promised more than arrived.
    pub fn finish(&self) -> Result<(), Fault> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Fault::Codec(format!(
                "stream ended with {} bytes of an incomplete frame",
                self.buf.len()
            )))
        }
    }
}

/// Apply ±[`JITTER_MS`] of uniform jitter to a millisecond timestamp.
pub fn jitter_timestamp(timestamp_ms: i64) -> i64 {
    timestamp_ms + rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS)
}

/// Jittered wall clock, milliseconds since the epoch.
pub fn now_jittered() -> i64 {
    jitter_timestamp(chrono::Utc::now().timestamp_millis())
}

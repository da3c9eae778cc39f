//! Input packet type consumed by the fragmenters.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A single compressed media packet.
///
/// Timestamps are relative to the start of the stream. Within a track, DTS
/// must be non-decreasing; packets that share a DTS are coalesced by the
/// fragmenter.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Index of the stream this packet belongs to.
    pub track: usize,
    /// Decode timestamp since the start of the stream.
    pub dts: Duration,
    /// Signed presentation offset relative to `dts`, in nanoseconds.
    pub cts_offset: i64,
    /// Whether this packet starts with a keyframe. Meaningful for video only.
    pub is_keyframe: bool,
    /// Wall-clock time of a keyframe packet, if known.
    pub program_time: Option<DateTime<Utc>>,
    /// Compressed payload.
    pub data: Vec<u8>,
}

//! Conversion between nanosecond timestamps and media timescales.
//!
//! All conversions round half up with ties away from zero, using 128-bit
//! intermediates so that large timestamps multiplied by large timescales
//! cannot overflow. Sample durations are always computed as the difference
//! of two converted timestamps, never by converting a duration directly,
//! which keeps rounding error from accumulating across a run.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Convert a timestamp since stream start to ticks of the given timescale.
pub fn to_scale(t: Duration, scale: u32) -> u64 {
    let ns = t.as_nanos();
    ((ns * scale as u128 + NANOS_PER_SEC / 2) / NANOS_PER_SEC) as u64
}

/// Convert a signed nanosecond offset to ticks of the given timescale.
pub fn to_scale_signed(ns: i64, scale: u32) -> i64 {
    let prod = ns as i128 * scale as i128;
    let half = NANOS_PER_SEC as i128 / 2;
    let rounded = if prod >= 0 {
        (prod + half) / NANOS_PER_SEC as i128
    } else {
        (prod - half) / NANOS_PER_SEC as i128
    };
    rounded as i64
}

/// Convert ticks back to a duration. Used by manifest code that needs
/// wall-clock values out of media timestamps.
pub fn from_scale(ticks: u64, scale: u32) -> Duration {
    let ns = ticks as u128 * NANOS_PER_SEC / scale as u128;
    Duration::from_nanos(ns as u64)
}

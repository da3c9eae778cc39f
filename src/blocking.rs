//! LL-HLS blocking-reload support: `_HLS_msn`/`_HLS_part` parsing and the
//! wait loops behind blocking playlist and segment requests.

use crate::names::PartMsn;
use crate::snapshot::{Snapshot, SnapshotStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// A wanted MSN may be at most this far past the completion watermark
/// before the request is rejected as too far in the future.
pub const FUTURE_SEGMENTS: i64 = 3;

/// How long a matching `If-None-Match` waits for the manifest to change.
pub const ETAG_WAIT: Duration = Duration::from_secs(10);

/// Parse the `_HLS_msn` and `_HLS_part` query parameters.
///
/// Absent parameters mean "don't block". Malformed or negative values are
/// a client error.
pub fn parse_block(query: &HashMap<String, String>) -> Result<PartMsn, &'static str> {
    let mut want = PartMsn::NONE;
    let Some(v) = query.get("_HLS_msn") else {
        return Ok(want);
    };
    match v.parse::<i64>() {
        Ok(msn) if msn >= 0 => want.msn = msn,
        _ => return Err("invalid _HLS_msn"),
    }
    let Some(v) = query.get("_HLS_part") else {
        return Ok(want);
    };
    match v.parse::<i64>() {
        Ok(part) if part >= 0 => want.part = part as i32,
        _ => return Err("invalid _HLS_part"),
    }
    Ok(want)
}

/// Block until the completion watermark satisfies `want`, the publisher
/// goes away, or the limit passes. `None` means timeout; an invalid
/// snapshot means the stream ended.
pub async fn wait_for_watermark(
    store: &SnapshotStore,
    want: PartMsn,
    limit: Duration,
) -> Option<Arc<Snapshot>> {
    let deadline = Instant::now() + limit;
    let mut rx = store.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        if !state.is_valid() || state.complete.satisfies(want) {
            return Some(state);
        }
        match timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            // timeout, or the publisher was dropped
            _ => return None,
        }
    }
}

/// Block until `extract` yields an ETag different from `previous`, or the
/// wait window passes. Always returns the latest snapshot seen.
pub async fn wait_for_etag<F>(store: &SnapshotStore, previous: &str, extract: F) -> Arc<Snapshot>
where
    F: Fn(&Snapshot) -> Option<String>,
{
    let deadline = Instant::now() + ETAG_WAIT;
    let mut rx = store.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        match extract(&state) {
            Some(etag) if etag_matches(&etag, previous) => {}
            _ => return state,
        }
        match timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            _ => return state,
        }
    }
}

/// Compare an ETag against an `If-None-Match` value, ignoring weak
/// prefixes.
pub fn etag_matches(etag: &str, if_none_match: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("W/").to_string();
    !if_none_match.is_empty() && strip(etag) == strip(if_none_match)
}

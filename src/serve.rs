//! HTTP read path: URL dispatch, blocking playlist reloads, segment and
//! part serving with live trickle.
//!
//! The single-character prefix of the basename selects the surface: `m` or
//! `i` for the main playlist and DASH manifest, a track digit for media
//! playlists, init blobs and segments, plus the `time` and `tail`
//! endpoints. Handlers are read-only against the published snapshot;
//! cancellation is the request future being dropped.

use crate::blocking::{self, FUTURE_SEGMENTS};
use crate::names::{Msn, PartMsn};
use crate::publisher::Publisher;
use crate::segment::{Chunk, Segment};
use crate::snapshot::{SegmentLookup, Snapshot};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    routing::get,
    Router,
};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::stream;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MPD_CONTENT_TYPE: &str = "application/dash+xml";
const INIT_CONTENT_TYPE: &str = "video/mp4";

/// Build a router serving the publisher under any base path.
pub fn router(publisher: Arc<Publisher>) -> Router {
    Router::new().fallback(get(handle)).with_state(publisher)
}

async fn handle(
    State(publisher): State<Arc<Publisher>>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let basename = uri.path().rsplit('/').next().unwrap_or("").to_string();
    if basename == "time" {
        return serve_time();
    }
    if basename == "tail" {
        return serve_tail(publisher).await;
    }
    let state = publisher.load();
    if !state.is_valid() {
        return not_found();
    }
    let Some(first) = basename.chars().next() else {
        return not_found();
    };
    let rest = basename.get(1..).unwrap_or("");
    match first {
        'm' | 'i' => match extension(rest) {
            ".m3u8" => match state.combo {
                // players that can't drive separate tracks get the
                // combined rendition as the main playlist
                Some(combo) => serve_playlist(&publisher, state, combo, &query, &headers).await,
                None => plain(PLAYLIST_CONTENT_TYPE, Body::from(state.master.clone())),
            },
            ".mpd" => serve_mpd(&publisher, state, &headers).await,
            _ => not_found(),
        },
        '0'..='9' => {
            let track = (first as u8 - b'0') as usize;
            if track >= state.tracks.len() {
                return not_found();
            }
            match extension(rest) {
                ".m3u8" => serve_playlist(&publisher, state, track, &query, &headers).await,
                ".mp4" => {
                    let init = state.tracks[track].init.clone();
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, INIT_CONTENT_TYPE)
                        .header(header::CACHE_CONTROL, "max-age=31536000, immutable")
                        .body(Body::from(init))
                        .unwrap()
                }
                ".m4s" | ".ts" => serve_media(&publisher, state, track, rest).await,
                _ => not_found(),
            }
        }
        _ => not_found(),
    }
}

fn extension(name: &str) -> &str {
    name.rfind('.').map(|i| &name[i..]).unwrap_or("")
}

/// Wall-clock reference for players and the DASH UTCTiming element.
fn serve_time() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "max-age=0, no-cache, no-store")
        .body(Body::from(
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        ))
        .unwrap()
}

/// Media playlist with LL-HLS blocking-reload and ETag-wait semantics.
async fn serve_playlist(
    publisher: &Arc<Publisher>,
    state: Arc<Snapshot>,
    track: usize,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let want = match blocking::parse_block(query) {
        Ok(want) => want,
        Err(msg) => return status_text(StatusCode::BAD_REQUEST, msg),
    };
    if want.msn > state.complete.msn + FUTURE_SEGMENTS {
        return status_text(StatusCode::BAD_REQUEST, "_HLS_msn is in the distant future");
    }
    let mut state = state;
    if want.msn >= 0 && !state.complete.satisfies(want) {
        match blocking::wait_for_watermark(publisher.store(), want, block_limit(publisher)).await {
            Some(new_state) if new_state.is_valid() => state = new_state,
            // timeout or the stream disappeared
            _ => return not_found(),
        }
    }
    let Some(etag) = state.tracks.get(track).map(|t| t.etag.clone()) else {
        return not_found();
    };
    if let Some(if_none_match) = header_str(headers, header::IF_NONE_MATCH) {
        if blocking::etag_matches(&etag, &if_none_match) {
            state = blocking::wait_for_etag(publisher.store(), &if_none_match, |s| {
                s.tracks.get(track).map(|t| t.etag.clone())
            })
            .await;
        }
    }
    let Some(track_state) = state.tracks.get(track) else {
        return not_found();
    };
    if let Some(if_none_match) = header_str(headers, header::IF_NONE_MATCH) {
        if blocking::etag_matches(&track_state.etag, &if_none_match) {
            return not_modified(&track_state.etag);
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::ETAG, track_state.etag.clone())
        .body(Body::from(track_state.playlist.clone()))
        .unwrap()
}

/// DASH manifest with the same conditional-GET wait as playlists.
async fn serve_mpd(
    publisher: &Arc<Publisher>,
    state: Arc<Snapshot>,
    headers: &HeaderMap,
) -> Response {
    let Some(mpd) = state.mpd.clone() else {
        return not_found();
    };
    let mut mpd = mpd;
    if let Some(if_none_match) = header_str(headers, header::IF_NONE_MATCH) {
        if blocking::etag_matches(&mpd.etag, &if_none_match) {
            let state = blocking::wait_for_etag(publisher.store(), &if_none_match, |s| {
                s.mpd.as_ref().map(|m| m.etag.clone())
            })
            .await;
            match state.mpd.clone() {
                Some(newer) => mpd = newer,
                None => return not_found(),
            }
            if blocking::etag_matches(&mpd.etag, &if_none_match) {
                return not_modified(&mpd.etag);
            }
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MPD_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "public, max-age=0, must-revalidate")
        .header(header::ETAG, mpd.etag.clone())
        .body(Body::from(mpd.body.clone()))
        .unwrap()
}

/// Media segment or part, waiting for content that is about to exist.
async fn serve_media(
    publisher: &Arc<Publisher>,
    state: Arc<Snapshot>,
    track: usize,
    rest: &str,
) -> Response {
    let (id, content_type) = {
        let Some(track_state) = state.tracks.get(track) else {
            return not_found();
        };
        let Some(name) = rest.strip_prefix(state.pid.as_str()) else {
            return not_found();
        };
        let Some(id) = track_state.parser.parse(name) else {
            return not_found();
        };
        (id, track_state.segment_content_type)
    };

    let mut state = state;
    let mut lookup = state.get(track, id.msn);
    let needs_wait = match &lookup {
        SegmentLookup::Pending => true,
        SegmentLookup::Ready(_) if id.part >= 0 => !state.complete.satisfies(id),
        _ => false,
    };
    if needs_wait {
        // a whole-segment request only waits for the first part and then
        // trickles the rest, which keeps LL-DASH players fed
        let want = PartMsn {
            msn: id.msn,
            part: id.part.max(0),
        };
        match blocking::wait_for_watermark(publisher.store(), want, block_limit(publisher)).await {
            Some(new_state) if new_state.is_valid() => {
                state = new_state;
                lookup = state.get(track, id.msn);
            }
            _ => return not_found(),
        }
    }
    match lookup {
        SegmentLookup::Ready(seg) => serve_segment(seg, id.part, content_type),
        SegmentLookup::Expired | SegmentLookup::Pending => not_found(),
    }
}

fn serve_segment(seg: Arc<Segment>, part: i32, content_type: &'static str) -> Response {
    if part >= 0 {
        return match seg.chunk_at(part as usize) {
            Chunk::Data(bytes) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "max-age=15, public")
                .body(Body::from(bytes))
                .unwrap(),
            Chunk::Gone => status_text(StatusCode::GONE, "segment released"),
            Chunk::Wait | Chunk::Finished => not_found(),
        };
    }
    // whole segment: a finalized one has a known length and long cache
    // life; a live one trickles parts as they are appended
    let finalized = seg.is_final();
    let size = seg.size();
    if finalized && size == 0 {
        return status_text(StatusCode::GONE, "segment released");
    }
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    builder = if finalized {
        builder
            .header(header::CACHE_CONTROL, "max-age=180, public")
            .header(header::CONTENT_LENGTH, size)
    } else {
        builder.header(header::CACHE_CONTROL, "max-age=0, no-cache")
    };
    builder
        .body(Body::from_stream(trickle_stream(seg)))
        .unwrap()
}

/// Parts in append order; waits while the segment is live, falls back to
/// the overflow file once buffers are dropped, ends cleanly on release.
fn trickle_stream(seg: Arc<Segment>) -> impl futures::Stream<Item = io::Result<Bytes>> {
    stream::unfold((seg, 0usize), |(seg, idx)| async move {
        match seg.next_chunk(idx).await {
            Chunk::Data(bytes) => Some((Ok(bytes), (seg, idx + 1))),
            Chunk::Finished | Chunk::Gone | Chunk::Wait => None,
        }
    })
}

/// One endless fMP4 body: init header, then every future segment in order.
async fn serve_tail(publisher: Arc<Publisher>) -> Response {
    let state = publisher.load();
    if !state.is_valid() {
        return not_found();
    }
    let Some(track) = state.combo else {
        // separate-tracks mode has no combined rendition to tail
        return not_found();
    };
    let init = state.tracks[track].init.clone();
    let first = state.complete.msn + 1;
    let stream = tail_stream(publisher.clone(), track, first, init);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, INIT_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "max-age=0, no-cache, no-store")
        .body(Body::from_stream(stream))
        .unwrap()
}

enum TailState {
    Init(Msn),
    WaitSegment(Msn),
    Read(Msn, Arc<Segment>, usize),
}

fn tail_stream(
    publisher: Arc<Publisher>,
    track: usize,
    first: Msn,
    init: Bytes,
) -> impl futures::Stream<Item = io::Result<Bytes>> {
    stream::unfold(
        (publisher, TailState::Init(first)),
        move |(publisher, state)| {
            let init = init.clone();
            async move {
                let mut state = state;
                loop {
                    match state {
                        TailState::Init(msn) => {
                            return Some((Ok(init), (publisher, TailState::WaitSegment(msn))));
                        }
                        TailState::WaitSegment(msn) => {
                            let want = PartMsn { msn, part: 0 };
                            let snap = blocking::wait_for_watermark(
                                publisher.store(),
                                want,
                                block_limit(&publisher),
                            )
                            .await;
                            match snap {
                                Some(snap) if snap.is_valid() => match snap.get(track, msn) {
                                    SegmentLookup::Ready(seg) => {
                                        state = TailState::Read(msn, seg, 0);
                                    }
                                    _ => return None,
                                },
                                _ => return None,
                            }
                        }
                        TailState::Read(msn, seg, idx) => match seg.next_chunk(idx).await {
                            Chunk::Data(bytes) => {
                                return Some((
                                    Ok(bytes),
                                    (publisher, TailState::Read(msn, seg, idx + 1)),
                                ));
                            }
                            Chunk::Finished => state = TailState::WaitSegment(msn + 1),
                            Chunk::Gone | Chunk::Wait => return None,
                        },
                    }
                }
            }
        },
    )
}

fn block_limit(publisher: &Publisher) -> Duration {
    publisher.config().initial_duration() + Duration::from_secs(1)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn plain(content_type: &str, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

fn status_text(status: StatusCode, msg: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(msg.to_string()))
        .unwrap()
}

fn not_found() -> Response {
    status_text(StatusCode::NOT_FOUND, "not found")
}

fn not_modified(etag: &str) -> Response {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, etag)
        .body(Body::empty())
        .unwrap()
}

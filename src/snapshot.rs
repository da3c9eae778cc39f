//! Lock-free published state.
//!
//! The ingest side rebuilds an immutable [`Snapshot`] on every part flush
//! and segment boundary and hands it to readers through a watch channel:
//! `load` is a wait-free borrow-and-clone, subscription is a cloned
//! receiver. Wakeups coalesce, which is harmless because every waiter
//! re-reads the snapshot after each wake.

use crate::names::{Msn, NameParser, PartMsn};
use crate::segment::Segment;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-track published state.
#[derive(Debug, Clone, Default)]
pub struct TrackSnapshot {
    /// Window of segments; index 0 is `base_msn`.
    pub segments: Vec<Arc<Segment>>,
    /// Rendered media playlist.
    pub playlist: Bytes,
    /// Weak ETag of the playlist body.
    pub etag: String,
    /// Initialization blob (`ftyp`+`moov`).
    pub init: Bytes,
    /// Filename parser for this track's segment files.
    pub parser: NameParser,
    /// Content type of segment files.
    pub segment_content_type: &'static str,
}

/// Rendered DASH manifest plus its ETag.
#[derive(Debug, Clone)]
pub struct MpdSnapshot {
    pub body: Bytes,
    pub etag: String,
}

/// Result of resolving an MSN against the window.
pub enum SegmentLookup {
    /// Trimmed off the front of the window.
    Expired,
    /// In the window right now.
    Ready(Arc<Segment>),
    /// Beyond the window; may arrive soon.
    Pending,
}

/// Immutable state shared with readers.
///
/// A reader holds the snapshot (and through it, segment cursors) for its
/// whole request; publishing a newer snapshot never mutates an old one.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tracks: Vec<TrackSnapshot>,
    /// Watermark: last complete MSN and the parts of the live segment
    /// after it.
    pub complete: PartMsn,
    pub base_msn: Msn,
    /// Publish id segment filenames are prefixed with.
    pub pid: String,
    /// Aggregate bandwidth in bits per second over finalized segments.
    pub bandwidth: u64,
    /// Master playlist body (separate-tracks mode only).
    pub master: Bytes,
    /// Index of the combined track, if one exists.
    pub combo: Option<usize>,
    /// Index of the video track driving segmentation.
    pub primary: usize,
    /// Current DASH manifest, if DASH is enabled.
    pub mpd: Option<Arc<MpdSnapshot>>,
}

impl Snapshot {
    /// An empty snapshot is published before the first segment and after
    /// close; readers treat it as "nothing here".
    pub fn is_valid(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Resolve a segment of a track by MSN.
    pub fn get(&self, track: usize, msn: Msn) -> SegmentLookup {
        let Some(track) = self.tracks.get(track) else {
            return SegmentLookup::Expired;
        };
        let idx = msn - self.base_msn;
        if idx < 0 {
            return SegmentLookup::Expired;
        }
        match track.segments.get(idx as usize) {
            Some(seg) => SegmentLookup::Ready(seg.clone()),
            None => SegmentLookup::Pending,
        }
    }
}

/// Atomic publish/load cell plus subscriber broadcast.
pub struct SnapshotStore {
    tx: watch::Sender<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx }
    }

    /// Swap in a new snapshot and wake all subscribers.
    pub fn publish(&self, snapshot: Snapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Current snapshot, wait-free.
    pub fn load(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

//! Ingest driver: routes packets to fragmenters, drives segment
//! boundaries, retention and snapshot publication.
//!
//! The ingest surface (`write_header` / `write_packet` / `discontinuity` /
//! `close`) is single-threaded by contract; its state lives behind one
//! mutex that HTTP readers never take. Readers only touch the published
//! snapshot and per-segment locks.

use crate::config::{Mode, PublisherConfig};
use crate::dash::{MpdTrack, MpdWriter, SegmentTiming};
use crate::error::{Error, Result};
use crate::names::{self, Msn, NameParser, PartMsn};
use crate::playlist::{self, MediaPlaylist};
use crate::rate;
use crate::segment::Segment;
use crate::snapshot::{MpdSnapshot, Snapshot, SnapshotStore, TrackSnapshot};
use bytes::Bytes;
use embercast_media::fmp4::init_blob;
use embercast_media::{CodecData, MovieFragmenter, Packet, RawFragment, TrackFragmenter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SEGMENT_SUFFIX: &str = ".m4s";
const SEGMENT_CONTENT_TYPE: &str = "video/iso.segment";
/// Tolerance on the fragment-length deadline.
const SLOP: Duration = Duration::from_millis(1);

enum Fragmenter {
    Track(TrackFragmenter),
    Movie(MovieFragmenter),
}

impl Fragmenter {
    fn write_packet(&mut self, pkt: Packet) -> embercast_media::Result<()> {
        match self {
            Fragmenter::Track(f) => f.write_packet(pkt),
            Fragmenter::Movie(f) => f.write_packet(pkt),
        }
    }

    fn duration(&self) -> Duration {
        match self {
            Fragmenter::Track(f) => f.duration(),
            Fragmenter::Movie(f) => f.duration(),
        }
    }

    fn make_fragment(&mut self) -> embercast_media::Result<Option<RawFragment>> {
        match self {
            Fragmenter::Track(f) => f.make_fragment(),
            Fragmenter::Movie(f) => f.make_fragment(),
        }
    }

    fn new_segment(&mut self) {
        match self {
            Fragmenter::Track(f) => f.new_segment(),
            Fragmenter::Movie(f) => f.new_segment(),
        }
    }
}

struct Track {
    frag: Fragmenter,
    /// Input stream this track carries; `None` for the combined track,
    /// which receives every stream.
    stream: Option<usize>,
    init: Bytes,
    codec_tag: String,
    segments: Vec<Arc<Segment>>,
    is_video: bool,
}

impl Track {
    fn current(&self) -> Option<&Arc<Segment>> {
        self.segments.last()
    }
}

#[derive(Default)]
struct Inner {
    streams: Vec<CodecData>,
    tracks: Vec<Track>,
    video_stream: usize,
    /// Track whose segments drive boundaries and the watermark.
    primary: usize,
    combo: Option<usize>,
    pid: String,
    base_msn: Msn,
    base_dcn: i64,
    next_dcn: bool,
    last_boundary: Option<Duration>,
    rate: rate::Detector,
    mpd: Option<MpdWriter>,
    mpd_snap: Option<Arc<MpdSnapshot>>,
    work_dir: Option<TempDir>,
}

/// A live HLS/DASH origin publisher.
///
/// One upstream producer feeds packets in; any number of HTTP readers
/// resolve requests against the published snapshots.
pub struct Publisher {
    cfg: PublisherConfig,
    store: SnapshotStore,
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl Publisher {
    pub fn new(cfg: PublisherConfig) -> Publisher {
        Publisher {
            cfg,
            store: SnapshotStore::new(),
            inner: Mutex::new(Inner::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.cfg
    }

    /// Current snapshot, wait-free.
    pub fn load(&self) -> Arc<Snapshot> {
        self.store.load()
    }

    pub(crate) fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Initialize the stream set. Must be called before the first packet.
    ///
    /// Calling again with codec data that produces identical init blobs is
    /// a no-op; anything else is [`Error::LayoutDrift`].
    pub fn write_header(&self, streams: &[CodecData]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let video_count = streams.iter().filter(|cd| cd.is_video()).count();
        if video_count != 1 {
            return Err(Error::NoPrimary);
        }

        let mut inner = self.inner.lock();
        if !inner.tracks.is_empty() {
            let candidate = compute_inits(streams, self.cfg.mode)?;
            let existing: Vec<&Bytes> = inner.tracks.iter().map(|t| &t.init).collect();
            if candidate.len() != existing.len()
                || candidate
                    .iter()
                    .zip(existing)
                    .any(|(a, b)| a.as_slice() != b.as_ref())
            {
                return Err(Error::LayoutDrift);
            }
            return Ok(());
        }

        let video_stream = streams
            .iter()
            .position(|cd| cd.is_video())
            .ok_or(Error::NoPrimary)?;
        let mode = self.cfg.mode;
        let mut tracks = Vec::new();
        if mode != Mode::SingleTrack {
            for (i, cd) in streams.iter().enumerate() {
                let frag = TrackFragmenter::new(i as u32 + 1, cd.clone());
                tracks.push(Track {
                    init: Bytes::from(frag.init_blob()),
                    codec_tag: cd.tag().map_err(Error::Media)?,
                    frag: Fragmenter::Track(frag),
                    stream: Some(i),
                    segments: Vec::new(),
                    is_video: cd.is_video(),
                });
            }
        }
        let combo = if mode != Mode::SeparateTracks {
            let movie = MovieFragmenter::new(streams).map_err(Error::Media)?;
            let tags: std::result::Result<Vec<String>, _> =
                streams.iter().map(|cd| cd.tag()).collect();
            tracks.push(Track {
                init: Bytes::copy_from_slice(movie.init_blob()),
                codec_tag: tags.map_err(Error::Media)?.join(","),
                frag: Fragmenter::Movie(movie),
                stream: None,
                segments: Vec::new(),
                is_video: true,
            });
            Some(tracks.len() - 1)
        } else {
            None
        };
        if tracks.len() > 10 {
            // a single digit addresses the track in segment URLs
            return Err(Error::Media(embercast_media::Error::invalid_codec(
                "too many tracks",
            )));
        }

        let pid = names::publish_id();
        let work_dir = match &self.cfg.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                TempDir::new_in(dir)?
            }
            None => TempDir::new()?,
        };

        let mpd = if mode != Mode::SingleTrack {
            let mpd_tracks = streams
                .iter()
                .enumerate()
                .map(|(i, cd)| {
                    Ok(MpdTrack {
                        content_type: if cd.is_video() { "video" } else { "audio" },
                        codec_tag: cd.tag()?,
                        timescale: cd.timescale(),
                        init_uri: format!("{i}{pid}init.mp4"),
                        media_uri: format!("{i}{pid}$Number$.m4s"),
                        width: match cd {
                            CodecData::H264(v) => v.width,
                            _ => 0,
                        },
                        height: match cd {
                            CodecData::H264(v) => v.height,
                            _ => 0,
                        },
                        sample_rate: match cd {
                            CodecData::Aac(a) => a.sample_rate,
                            CodecData::Opus(_) => embercast_media::codec::OPUS_SAMPLE_RATE,
                            CodecData::H264(_) => 0,
                        },
                        channels: match cd {
                            CodecData::Aac(a) => a.channels,
                            CodecData::Opus(o) => o.channels,
                            CodecData::H264(_) => 0,
                        },
                    })
                })
                .collect::<embercast_media::Result<Vec<_>>>()
                .map_err(Error::Media)?;
            Some(MpdWriter::new(&pid, mpd_tracks, self.cfg.buffer_length()))
        } else {
            None
        };

        tracing::info!(
            streams = streams.len(),
            mode = ?mode,
            pid = %pid,
            "publish started"
        );
        inner.streams = streams.to_vec();
        inner.tracks = tracks;
        inner.video_stream = video_stream;
        inner.primary = match mode {
            Mode::SingleTrack => combo.unwrap_or(0),
            _ => video_stream,
        };
        inner.combo = combo;
        inner.pid = pid;
        inner.mpd = mpd;
        inner.work_dir = Some(work_dir);
        Ok(())
    }

    /// Publish a single packet. Any error is terminal: the publisher closes
    /// itself and blocked readers drain with 404.
    pub fn write_packet(&self, pkt: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let result = self.write_packet_inner(pkt);
        if let Err(err) = &result {
            tracing::error!(%err, "ingest failed, closing publish");
            self.close();
        }
        result
    }

    fn write_packet_inner(&self, pkt: Packet) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.tracks.is_empty() {
            return Err(Error::HeaderRequired);
        }
        if pkt.track >= inner.streams.len() {
            return Err(Error::Media(embercast_media::Error::invalid_codec(
                "packet track index out of range",
            )));
        }
        let is_video = pkt.track == inner.video_stream;
        if is_video {
            inner.rate.append(pkt.dts);
        }
        let has_segments = !inner.tracks[inner.primary].segments.is_empty();
        if !has_segments && !is_video {
            // waiting for the first video packet to open a segment
            return Ok(());
        }
        let boundary = is_video
            && (!has_segments
                || (pkt.is_keyframe && inner.last_boundary != Some(pkt.dts)));
        let dts = pkt.dts;
        let program_time = pkt.program_time;

        // route the packet before acting on the boundary so fragments flush
        // right up to the keyframe's DTS
        for idx in 0..inner.tracks.len() {
            let wants = match inner.tracks[idx].stream {
                Some(s) => s == pkt.track,
                None => true,
            };
            if wants {
                inner.tracks[idx]
                    .frag
                    .write_packet(pkt.clone())
                    .map_err(Error::Media)?;
            }
        }

        if boundary {
            inner.new_segment(dts, program_time, &self.cfg, &self.store)?;
            inner.last_boundary = Some(dts);
        } else if is_video
            && inner.tracks[inner.primary].frag.duration() + SLOP >= self.cfg.fragment_length()
        {
            inner.flush()?;
            inner.publish_snapshot(&self.cfg, &self.store, Duration::ZERO);
        }
        Ok(())
    }

    /// Mark that the next segment follows a decoder reset.
    pub fn discontinuity(&self) {
        self.inner.lock().next_dcn = true;
    }

    /// End the publish: releases every segment, wakes all blocked readers
    /// with an empty snapshot and removes the work directory.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        self.store.publish(Snapshot::default());
        for track in &mut inner.tracks {
            for seg in track.segments.drain(..) {
                seg.release();
            }
        }
        inner.mpd_snap = None;
        inner.work_dir = None;
        tracing::info!("publish closed");
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    /// Longest finalized segment or the pending fragment span, rounded up
    /// to whole seconds; configuration supplies the fallback.
    fn target_duration(&self, cfg: &PublisherConfig) -> Duration {
        let primary = &self.tracks[self.primary];
        let mut max = primary.frag.duration();
        for seg in &primary.segments {
            if let Some((_, dur)) = seg.final_stats() {
                if dur > max {
                    max = dur;
                }
            }
        }
        if max.is_zero() {
            return cfg.initial_duration();
        }
        let up = max.subsec_nanos() > 0;
        Duration::from_secs(max.as_secs() + u64::from(up))
    }

    /// Emit a partial fragment from every track into its current segment.
    fn flush(&mut self) -> Result<()> {
        for track in &mut self.tracks {
            if let Some(frag) = track.frag.make_fragment().map_err(Error::Media)? {
                if let Some(seg) = track.segments.last() {
                    seg.append(&frag).map_err(Error::DiskWrite)?;
                }
            }
        }
        Ok(())
    }

    /// Finalize the current segments at `start` and open aligned new ones
    /// on every track.
    fn new_segment(
        &mut self,
        start: Duration,
        program_time: Option<chrono::DateTime<chrono::Utc>>,
        cfg: &PublisherConfig,
        store: &SnapshotStore,
    ) -> Result<()> {
        if !self.tracks[self.primary].segments.is_empty() {
            self.flush()?;
            for track in &self.tracks {
                if let Some(seg) = track.current() {
                    seg.finalize(start);
                }
            }
        }
        let target = self.target_duration(cfg);
        let next_msn = self.base_msn + self.tracks[self.primary].segments.len() as i64;
        let dcn = self.next_dcn;
        let work_dir = self
            .work_dir
            .as_ref()
            .ok_or(Error::Closed)?
            .path()
            .to_path_buf();
        for idx in 0..self.tracks.len() {
            self.tracks[idx].frag.new_segment();
            let base = names::segment_base(idx, &self.pid, next_msn);
            let seg = Segment::new(
                base,
                SEGMENT_SUFFIX.to_string(),
                &work_dir,
                start,
                dcn,
                program_time,
                target,
            )?;
            self.tracks[idx].segments.push(Arc::new(seg));
        }
        tracing::debug!(
            msn = next_msn,
            start_ms = start.as_millis() as u64,
            dcn,
            "segment opened"
        );
        self.trim_segments(cfg, target);
        self.update_mpd(cfg, target);
        self.publish_snapshot(cfg, store, target);
        self.next_dcn = false;
        Ok(())
    }

    /// Drop segments off the front of every track once the window exceeds
    /// the retention policy.
    fn trim_segments(&mut self, cfg: &PublisherConfig, seg_len: Duration) {
        let seg_ms = seg_len.max(Duration::from_secs(1)).as_millis();
        let buffer_ms = cfg.buffer_length().as_millis();
        let keep = (((buffer_ms + seg_ms - 1) / seg_ms + 1) as usize).max(10);
        let n = self.tracks[self.primary].segments.len().saturating_sub(keep);
        if n == 0 {
            return;
        }
        self.base_msn += n as i64;
        let primary = self.primary;
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            for seg in track.segments.drain(..n) {
                if idx == primary && seg.discontinuous() {
                    self.base_dcn += 1;
                }
                seg.release();
            }
        }
        tracing::debug!(dropped = n, base_msn = self.base_msn, "trimmed segments");
    }

    /// Rebuild the DASH manifest from the per-stream timelines.
    fn update_mpd(&mut self, cfg: &PublisherConfig, target: Duration) {
        let Some(mpd) = &self.mpd else {
            return;
        };
        let timelines: Vec<Vec<SegmentTiming>> = (0..self.streams.len())
            .map(|i| {
                self.tracks[i]
                    .segments
                    .iter()
                    .map(|seg| SegmentTiming {
                        start: seg.start(),
                        dur: seg
                            .final_stats()
                            .map(|(_, dur)| dur)
                            .unwrap_or(Duration::ZERO),
                        size: seg.size(),
                    })
                    .collect()
            })
            .collect();
        let snap = mpd.render(
            target,
            cfg.fragment_length(),
            self.base_msn,
            &timelines,
            &self.rate.rate(),
        );
        self.mpd_snap = Some(Arc::new(snap));
    }

    /// Build and publish an immutable snapshot of the whole window.
    fn publish_snapshot(&self, cfg: &PublisherConfig, store: &SnapshotStore, target: Duration) {
        let target = if target.is_zero() {
            self.target_duration(cfg)
        } else {
            target
        };
        let primary = &self.tracks[self.primary];
        let mut complete_index: i64 = -1;
        let mut complete_parts: i32 = -1;
        for (i, seg) in primary.segments.iter().enumerate() {
            if seg.is_final() {
                complete_index = i as i64;
            } else if i as i64 == complete_index + 1 {
                complete_parts = seg.parts_len() as i32;
            }
        }
        let complete = PartMsn {
            msn: self.base_msn + complete_index,
            part: complete_parts,
        };

        let mut total_bytes = 0u64;
        let mut total_secs = 0f64;
        for (idx, track) in self.tracks.iter().enumerate() {
            if Some(idx) == self.combo && self.tracks.len() > 1 {
                continue;
            }
            for seg in &track.segments {
                if let Some((bytes, dur)) = seg.final_stats() {
                    total_bytes += bytes;
                    total_secs += dur.as_secs_f64();
                }
            }
        }
        let bandwidth = if total_secs > 0.0 {
            (total_bytes as f64 * 8.0 / total_secs) as u64
        } else {
            0
        };

        let tracks = self
            .tracks
            .iter()
            .enumerate()
            .map(|(idx, track)| {
                let body = MediaPlaylist {
                    target,
                    base_msn: self.base_msn,
                    base_dcn: self.base_dcn,
                    part_target: cfg.fragment_length(),
                    part_hold_back: cfg.part_hold_back(),
                    init_uri: format!("{idx}{}init.mp4", self.pid),
                    segments: &track.segments,
                }
                .render();
                let etag = playlist::playlist_etag(body.as_bytes());
                TrackSnapshot {
                    segments: track.segments.clone(),
                    playlist: Bytes::from(body),
                    etag,
                    init: track.init.clone(),
                    parser: NameParser {
                        suffix: SEGMENT_SUFFIX.to_string(),
                    },
                    segment_content_type: SEGMENT_CONTENT_TYPE,
                }
            })
            .collect();

        let master = if self.combo.is_none() {
            let codecs: Vec<&str> = self
                .tracks
                .iter()
                .filter(|t| t.stream.is_some())
                .map(|t| t.codec_tag.as_str())
                .collect();
            let audio_uris: Vec<String> = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.stream.is_some() && !t.is_video)
                .map(|(idx, _)| format!("{idx}{}.m3u8", self.pid))
                .collect();
            let video_uri = format!("{}{}.m3u8", self.video_stream, self.pid);
            playlist::master_playlist(bandwidth, &codecs.join(","), &video_uri, &audio_uris)
        } else {
            String::new()
        };

        store.publish(Snapshot {
            tracks,
            complete,
            base_msn: self.base_msn,
            pid: self.pid.clone(),
            bandwidth,
            master: Bytes::from(master),
            combo: self.combo,
            primary: self.primary,
            mpd: self.mpd_snap.clone(),
        });
    }
}

/// Init blobs, in track order, that a stream set would produce under the
/// given mode. Used to detect layout drift on repeated headers.
fn compute_inits(streams: &[CodecData], mode: Mode) -> Result<Vec<Vec<u8>>> {
    let mut inits = Vec::new();
    if mode != Mode::SingleTrack {
        for (i, cd) in streams.iter().enumerate() {
            inits.push(init_blob(&[(i as u32 + 1, cd)]));
        }
    }
    if mode != Mode::SeparateTracks {
        let pairs: Vec<(u32, &CodecData)> = streams
            .iter()
            .enumerate()
            .map(|(i, cd)| (i as u32 + 1, cd))
            .collect();
        inits.push(init_blob(&pairs));
    }
    Ok(inits)
}

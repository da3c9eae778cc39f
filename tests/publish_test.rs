//! Ingest-side integration tests: segmentation, retention, playlists and
//! snapshot semantics, driven straight through the publisher API.

mod common;

use common::{audio_packet, streams, video_packet, TestHarness, AUDIO_STRIDE};
use embercast::media::{CodecData, H264Config};
use embercast::{Error, Mode, PublisherConfig};
use std::time::Duration;

fn separate_tracks() -> PublisherConfig {
    PublisherConfig {
        initial_duration: Duration::from_secs(1),
        fragment_length: Duration::from_millis(200),
        mode: Mode::SeparateTracks,
        ..Default::default()
    }
}

#[tokio::test]
async fn no_snapshot_before_first_keyframe() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    assert!(!h.publisher.load().is_valid());
    // audio before the first video packet is dropped
    h.publisher
        .write_packet(audio_packet(Duration::ZERO))
        .unwrap();
    assert!(!h.publisher.load().is_valid());
}

#[tokio::test]
async fn write_packet_requires_header() {
    let h = TestHarness::new(separate_tracks());
    let err = h
        .publisher
        .write_packet(video_packet(Duration::ZERO, true))
        .unwrap_err();
    assert!(matches!(err, Error::HeaderRequired));
}

#[tokio::test]
async fn header_requires_exactly_one_video() {
    let h = TestHarness::new(separate_tracks());
    let audio_only = vec![streams()[1].clone()];
    assert!(matches!(
        h.publisher.write_header(&audio_only),
        Err(Error::NoPrimary)
    ));
    let two_video = vec![streams()[0].clone(), streams()[0].clone()];
    assert!(matches!(
        h.publisher.write_header(&two_video),
        Err(Error::NoPrimary)
    ));
}

/// Scenario: one keyframe, then packets but never a second keyframe. The
/// single live segment never finalizes.
#[tokio::test]
async fn single_gop_never_finalizes() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    let stride = Duration::from_nanos(33_366_667);
    h.publisher
        .write_packet(video_packet(Duration::ZERO, true))
        .unwrap();
    for i in 1..=23u32 {
        h.publisher
            .write_packet(video_packet(stride * i, false))
            .unwrap();
    }
    for i in 0..46u32 {
        h.publisher
            .write_packet(audio_packet(AUDIO_STRIDE * i))
            .unwrap();
    }

    let snap = h.publisher.load();
    assert!(snap.is_valid());
    assert_eq!(snap.base_msn, 0);
    assert_eq!(snap.complete.msn, -1);
    assert!(snap.complete.part >= 0);
    for track in &snap.tracks {
        assert_eq!(track.segments.len(), 1);
        assert!(!track.segments[0].is_final());
    }
    let playlist = std::str::from_utf8(&snap.tracks[0].playlist).unwrap();
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
    assert!(!playlist.contains("#EXTINF"));
}

/// Scenario: a 2s GOP closed by the next keyframe produces one finalized
/// segment of exactly 2s.
#[tokio::test]
async fn second_keyframe_finalizes_first_segment() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(2));
    h.publisher
        .write_packet(video_packet(Duration::from_secs(2), true))
        .unwrap();

    let snap = h.publisher.load();
    assert_eq!(snap.complete.msn, 0);
    let video = &snap.tracks[0];
    assert_eq!(video.segments.len(), 2);
    assert!(video.segments[0].is_final());
    assert_eq!(video.segments[0].duration(), Duration::from_secs(2));
    let playlist = std::str::from_utf8(&video.playlist).unwrap();
    let expected = format!("#EXTINF:2.000000,\n0{}0.m4s\n", snap.pid);
    assert!(
        playlist.contains(&expected),
        "playlist missing {expected:?}:\n{playlist}"
    );
}

/// Scenario: 5s of media with 2s GOPs and 200ms fragments yields two
/// finalized segments and a part-dense playlist.
#[tokio::test]
async fn parts_accumulate_across_window() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(2));
    h.feed_gop(Duration::from_secs(2), Duration::from_secs(2));
    h.feed_gop(Duration::from_secs(4), Duration::from_secs(1));

    let snap = h.publisher.load();
    assert_eq!(snap.complete.msn, 1);
    assert!(snap.complete.part >= 3);
    let playlist = std::str::from_utf8(&snap.tracks[0].playlist).unwrap();
    assert!(playlist.contains("#EXT-X-PART-INF:PART-TARGET=0.200000\n"));
    let part_lines = playlist.matches("#EXT-X-PART:").count();
    assert!(part_lines >= 10, "only {part_lines} part lines:\n{playlist}");
    assert!(playlist.contains("#EXT-X-PRELOAD-HINT:TYPE=PART,"));
}

/// Part durations of a finalized segment must sum to its duration.
#[tokio::test]
async fn part_durations_tile_segment() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(2));
    h.publisher
        .write_packet(video_packet(Duration::from_secs(2), true))
        .unwrap();

    let snap = h.publisher.load();
    let playlist = std::str::from_utf8(&snap.tracks[0].playlist).unwrap();
    let base = format!("0{}0.", snap.pid);
    let mut sum = 0f64;
    for line in playlist.lines() {
        let Some(rest) = line.strip_prefix("#EXT-X-PART:DURATION=") else {
            continue;
        };
        if !line.contains(&format!("URI=\"{base}")) {
            continue;
        }
        let dur: f64 = rest.split(',').next().unwrap().parse().unwrap();
        sum += dur;
    }
    assert!(
        (sum - 2.0).abs() < 0.001,
        "parts sum to {sum}, expected 2.0:\n{playlist}"
    );
}

/// MSN windows stay element-wise aligned across tracks, including the
/// combined rendition.
#[tokio::test]
async fn tracks_stay_aligned() {
    let cfg = PublisherConfig {
        initial_duration: Duration::from_secs(1),
        fragment_length: Duration::from_millis(200),
        mode: Mode::SingleAndSeparate,
        ..Default::default()
    };
    let h = TestHarness::new(cfg);
    h.write_header();
    for i in 0..5u64 {
        h.feed_gop(Duration::from_secs(i), Duration::from_secs(1));
    }
    let snap = h.publisher.load();
    assert_eq!(snap.tracks.len(), 3);
    assert_eq!(snap.combo, Some(2));
    let len = snap.tracks[0].segments.len();
    for track in &snap.tracks {
        assert_eq!(track.segments.len(), len);
    }
    // base names differ only in the leading track digit
    for i in 0..len {
        let strip = |t: usize| snap.tracks[t].segments[i].base()[1..].to_string();
        assert_eq!(strip(0), strip(1));
        assert_eq!(strip(0), strip(2));
    }
}

/// Retention: the window stays within policy and the base MSN advances.
#[tokio::test]
async fn retention_trims_old_segments() {
    let cfg = PublisherConfig {
        initial_duration: Duration::from_secs(1),
        buffer_length: Duration::from_secs(4),
        fragment_length: Duration::from_millis(200),
        mode: Mode::SeparateTracks,
        ..Default::default()
    };
    let h = TestHarness::new(cfg);
    h.write_header();
    let mut last_base = 0;
    for i in 0..30u64 {
        h.feed_gop(Duration::from_secs(i), Duration::from_secs(1));
        let base = h.publisher.load().base_msn;
        assert!(base >= last_base, "base MSN went backwards");
        last_base = base;
    }
    let snap = h.publisher.load();
    // keep = max(10, ceil(4/1)+1) = 10, plus the live segment window
    assert_eq!(snap.tracks[0].segments.len(), 10);
    assert_eq!(snap.base_msn, 20);
    // trimmed segments are released
    assert!(matches!(
        snap.tracks[0].segments[0].base(),
        base if base.ends_with("20")
    ));
}

/// A discontinuity marks exactly the next segment.
#[tokio::test]
async fn discontinuity_marks_next_segment_once() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(1));
    h.feed_gop(Duration::from_secs(1), Duration::from_secs(1));
    h.publisher.discontinuity();
    h.feed_gop(Duration::from_secs(2), Duration::from_secs(1));
    h.feed_gop(Duration::from_secs(3), Duration::from_secs(1));

    let snap = h.publisher.load();
    let playlist = std::str::from_utf8(&snap.tracks[0].playlist).unwrap();
    assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY\n").count(), 1);
    assert!(snap.tracks[0].segments[2].discontinuous());
    assert!(!snap.tracks[0].segments[3].discontinuous());
}

/// Repeating write_header with identical codec data is a no-op; changing
/// it is layout drift.
#[tokio::test]
async fn header_rebuild_must_match() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.publisher.write_header(&streams()).unwrap();

    let mut changed = streams();
    changed[0] = CodecData::H264(H264Config {
        width: 1280,
        height: 720,
        record: vec![0x01, 0x64, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x00],
    });
    assert!(matches!(
        h.publisher.write_header(&changed),
        Err(Error::LayoutDrift)
    ));
}

/// A held snapshot never changes, no matter how much is published after.
#[tokio::test]
async fn snapshots_are_immutable() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(1));
    h.feed_gop(Duration::from_secs(1), Duration::from_secs(1));

    let held = h.publisher.load();
    let held_playlist = held.tracks[0].playlist.clone();
    let held_msn = held.complete.msn;

    for i in 2..6u64 {
        h.feed_gop(Duration::from_secs(i), Duration::from_secs(1));
    }
    assert_eq!(held.tracks[0].playlist, held_playlist);
    assert_eq!(held.complete.msn, held_msn);
    let fresh = h.publisher.load();
    assert_ne!(fresh.tracks[0].playlist, held_playlist);
}

/// Close publishes an empty snapshot and rejects further packets.
#[tokio::test]
async fn close_empties_state() {
    let h = TestHarness::new(separate_tracks());
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(1));
    let seg = h.publisher.load().tracks[0].segments[0].clone();

    h.publisher.close();
    assert!(!h.publisher.load().is_valid());
    assert!(matches!(
        h.publisher.write_packet(video_packet(Duration::from_secs(2), true)),
        Err(Error::Closed)
    ));
    // released segments refuse reads
    assert!(matches!(
        seg.chunk_at(0),
        embercast::segment::Chunk::Gone
    ));
}

/// Single-track mode muxes both streams into one rendition and disables
/// DASH.
#[tokio::test]
async fn single_track_mode() {
    let cfg = PublisherConfig {
        initial_duration: Duration::from_secs(1),
        fragment_length: Duration::from_millis(200),
        mode: Mode::SingleTrack,
        ..Default::default()
    };
    let h = TestHarness::new(cfg);
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(1));
    h.feed_gop(Duration::from_secs(1), Duration::from_secs(1));

    let snap = h.publisher.load();
    assert_eq!(snap.tracks.len(), 1);
    assert_eq!(snap.combo, Some(0));
    assert!(snap.mpd.is_none());
    let playlist = std::str::from_utf8(&snap.tracks[0].playlist).unwrap();
    assert!(playlist.contains("#EXT-X-MAP:URI=\"0"));
}

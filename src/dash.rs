//! DASH manifest (MPD) generation.
//!
//! The MPD is a derived view of the same timeline the HLS playlists
//! describe: a dynamic-profile manifest with one adaptation set per track,
//! a `SegmentTemplate` addressing the same files HLS serves, and a
//! `SegmentTimeline` rebuilt on every finalized segment. Part flushes never
//! touch it.

use crate::names::Msn;
use crate::rate::Rate;
use crate::snapshot::MpdSnapshot;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::Duration;

/// Static description of one track in the manifest.
#[derive(Debug, Clone)]
pub struct MpdTrack {
    /// `video` or `audio`.
    pub content_type: &'static str,
    pub codec_tag: String,
    pub timescale: u32,
    /// e.g. `0abcinit.mp4`
    pub init_uri: String,
    /// e.g. `0abc$Number$.m4s`
    pub media_uri: String,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Timing of one published segment, fed into the `SegmentTimeline`.
#[derive(Debug, Clone, Copy)]
pub struct SegmentTiming {
    pub start: Duration,
    /// Zero while the segment is live; the target duration is substituted.
    pub dur: Duration,
    pub size: u64,
}

/// Builder holding everything about the manifest that never changes during
/// a publish.
#[derive(Debug)]
pub struct MpdWriter {
    id: String,
    availability_start: DateTime<Utc>,
    buffer_length: Duration,
    tracks: Vec<MpdTrack>,
}

impl MpdWriter {
    pub fn new(pid: &str, tracks: Vec<MpdTrack>, buffer_length: Duration) -> Self {
        Self {
            id: format!("m{pid}"),
            availability_start: Utc::now(),
            buffer_length,
            tracks,
        }
    }

    /// Rebuild the manifest for the current window.
    ///
    /// `timelines` is parallel to the track list; live segments carry a
    /// zero duration and are reported with the target duration.
    pub fn render(
        &self,
        target: Duration,
        fragment_length: Duration,
        base_msn: Msn,
        timelines: &[Vec<SegmentTiming>],
        frame_rate: &Rate,
    ) -> MpdSnapshot {
        let availability_time_offset =
            (target.saturating_sub(fragment_length)).as_secs_f64();
        let sets = self
            .tracks
            .iter()
            .zip(timelines)
            .map(|(track, timeline)| {
                let is_video = track.content_type == "video";
                let mut total_size = 0u64;
                let mut total_dur = 0f64;
                let mut segments: Vec<S> = Vec::with_capacity(timeline.len());
                for (i, seg) in timeline.iter().enumerate() {
                    let dur = if seg.dur.is_zero() { target } else { seg.dur };
                    let start_ticks =
                        embercast_media::timescale::to_scale(seg.start, track.timescale);
                    let end_ticks =
                        embercast_media::timescale::to_scale(seg.start + dur, track.timescale);
                    let dur_ticks = end_ticks - start_ticks;
                    total_size += seg.size;
                    total_dur += dur.as_secs_f64();
                    match segments.last_mut() {
                        Some(last) if last.d == dur_ticks => {
                            *last.r.get_or_insert(0) += 1;
                        }
                        _ => segments.push(S {
                            // only the first run carries an absolute time
                            t: (i == 0).then_some(start_ticks),
                            d: dur_ticks,
                            r: None,
                        }),
                    }
                }
                let bandwidth = if total_dur > 0.0 {
                    (total_size as f64 * 8.0 / total_dur) as u64
                } else {
                    0
                };
                let rate_attr = is_video.then(|| frame_rate.to_attr()).flatten();
                AdaptationSet {
                    content_type: track.content_type,
                    segment_alignment: true,
                    max_width: is_video.then_some(track.width),
                    max_height: is_video.then_some(track.height),
                    max_frame_rate: rate_attr.clone(),
                    segment_template: SegmentTemplate {
                        timescale: track.timescale,
                        initialization: track.init_uri.clone(),
                        media: track.media_uri.clone(),
                        start_number: base_msn,
                        availability_time_complete: "false",
                        availability_time_offset,
                        segment_timeline: SegmentTimeline { segments },
                    },
                    representation: vec![Representation {
                        id: if is_video { "v0" } else { "a0" },
                        bandwidth,
                        codecs: track.codec_tag.clone(),
                        mime_type: if is_video { "video/mp4" } else { "audio/mp4" },
                        width: is_video.then_some(track.width),
                        height: is_video.then_some(track.height),
                        frame_rate: rate_attr,
                        audio_sampling_rate: (!is_video).then_some(track.sample_rate),
                        audio_channel_configuration: (!is_video).then_some(
                            AudioChannelConfiguration {
                                scheme_id_uri:
                                    "urn:mpeg:dash:23003:3:audio_channel_configuration:2011",
                                value: track.channels,
                            },
                        ),
                    }],
                }
            })
            .collect();

        let mpd = Mpd {
            xmlns: "urn:mpeg:dash:schema:mpd:2011",
            id: &self.id,
            profiles: "urn:mpeg:dash:profile:isoff-live:2011",
            kind: "dynamic",
            availability_start_time: self
                .availability_start
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            publish_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            max_segment_duration: iso_duration(target),
            min_buffer_time: iso_duration(Duration::from_secs(1)),
            time_shift_buffer_depth: iso_duration(self.buffer_length),
            periods: vec![Period {
                id: "p0",
                start: iso_duration(Duration::ZERO),
                adaptation_sets: sets,
            }],
            utc_timing: UtcTiming {
                scheme_id_uri: "urn:mpeg:dash:utc:http-xsdate:2014",
                value: "time",
            },
        };
        let body = match quick_xml::se::to_string(&mpd) {
            Ok(xml) => format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{xml}"),
            Err(err) => {
                // serialization of a fully-owned tree cannot realistically
                // fail; keep readers alive with an empty manifest if it does
                tracing::error!(%err, "MPD serialization failed");
                String::new()
            }
        };
        let etag = mpd_etag(body.as_bytes());
        MpdSnapshot {
            body: Bytes::from(body),
            etag,
        }
    }
}

fn mpd_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut hex = String::with_capacity(32);
    for b in &digest[..16] {
        let _ = write!(hex, "{b:02x}");
    }
    format!("\"{hex}\"")
}

/// ISO 8601 duration, e.g. `PT1M30.5S`.
pub fn iso_duration(d: Duration) -> String {
    let mut out = String::from("PT");
    let mut rest = d;
    let hours = rest.as_secs() / 3600;
    if hours > 0 {
        let _ = write!(out, "{hours}H");
        rest -= Duration::from_secs(hours * 3600);
    }
    let minutes = rest.as_secs() / 60;
    if minutes > 0 {
        let _ = write!(out, "{minutes}M");
        rest -= Duration::from_secs(minutes * 60);
    }
    if !rest.is_zero() || out.len() == 2 {
        let secs = rest.as_secs_f64();
        if secs.fract() == 0.0 {
            let _ = write!(out, "{}S", secs as u64);
        } else {
            let _ = write!(out, "{secs:.6}S");
        }
    }
    out
}

// Serde model of the manifest. Attribute fields must precede elements.

#[derive(Serialize)]
#[serde(rename = "MPD")]
struct Mpd<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@id")]
    id: &'a str,
    #[serde(rename = "@profiles")]
    profiles: &'static str,
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@availabilityStartTime")]
    availability_start_time: String,
    #[serde(rename = "@publishTime")]
    publish_time: String,
    #[serde(rename = "@maxSegmentDuration")]
    max_segment_duration: String,
    #[serde(rename = "@minBufferTime")]
    min_buffer_time: String,
    #[serde(rename = "@timeShiftBufferDepth")]
    time_shift_buffer_depth: String,
    #[serde(rename = "Period")]
    periods: Vec<Period>,
    #[serde(rename = "UTCTiming")]
    utc_timing: UtcTiming,
}

#[derive(Serialize)]
struct Period {
    #[serde(rename = "@id")]
    id: &'static str,
    #[serde(rename = "@start")]
    start: String,
    #[serde(rename = "AdaptationSet")]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Serialize)]
struct AdaptationSet {
    #[serde(rename = "@contentType")]
    content_type: &'static str,
    #[serde(rename = "@segmentAlignment")]
    segment_alignment: bool,
    #[serde(rename = "@maxWidth", skip_serializing_if = "Option::is_none")]
    max_width: Option<u32>,
    #[serde(rename = "@maxHeight", skip_serializing_if = "Option::is_none")]
    max_height: Option<u32>,
    #[serde(rename = "@maxFrameRate", skip_serializing_if = "Option::is_none")]
    max_frame_rate: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: SegmentTemplate,
    #[serde(rename = "Representation")]
    representation: Vec<Representation>,
}

#[derive(Serialize)]
struct SegmentTemplate {
    #[serde(rename = "@timescale")]
    timescale: u32,
    #[serde(rename = "@initialization")]
    initialization: String,
    #[serde(rename = "@media")]
    media: String,
    #[serde(rename = "@startNumber")]
    start_number: Msn,
    #[serde(rename = "@availabilityTimeComplete")]
    availability_time_complete: &'static str,
    #[serde(rename = "@availabilityTimeOffset")]
    availability_time_offset: f64,
    #[serde(rename = "SegmentTimeline")]
    segment_timeline: SegmentTimeline,
}

#[derive(Serialize)]
struct SegmentTimeline {
    #[serde(rename = "S")]
    segments: Vec<S>,
}

#[derive(Serialize)]
struct S {
    #[serde(rename = "@t", skip_serializing_if = "Option::is_none")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    #[serde(rename = "@r", skip_serializing_if = "Option::is_none")]
    r: Option<u32>,
}

#[derive(Serialize)]
struct Representation {
    #[serde(rename = "@id")]
    id: &'static str,
    #[serde(rename = "@bandwidth")]
    bandwidth: u64,
    #[serde(rename = "@codecs")]
    codecs: String,
    #[serde(rename = "@mimeType")]
    mime_type: &'static str,
    #[serde(rename = "@width", skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(rename = "@height", skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(rename = "@frameRate", skip_serializing_if = "Option::is_none")]
    frame_rate: Option<String>,
    #[serde(rename = "@audioSamplingRate", skip_serializing_if = "Option::is_none")]
    audio_sampling_rate: Option<u32>,
    #[serde(
        rename = "AudioChannelConfiguration",
        skip_serializing_if = "Option::is_none"
    )]
    audio_channel_configuration: Option<AudioChannelConfiguration>,
}

#[derive(Serialize)]
struct AudioChannelConfiguration {
    #[serde(rename = "@schemeIdUri")]
    scheme_id_uri: &'static str,
    #[serde(rename = "@value")]
    value: u16,
}

#[derive(Serialize)]
struct UtcTiming {
    #[serde(rename = "@schemeIdUri")]
    scheme_id_uri: &'static str,
    #[serde(rename = "@value")]
    value: &'static str,
}

//! Codec metadata consumed by the fragmenters and box writers.
//!
//! Codec configuration arrives from the demuxer as opaque bytes plus a few
//! descriptive fields; nothing here parses elementary streams beyond what
//! live fragmenting requires: audio packet durations and H.264 NALU
//! reframing.

use crate::error::{Error, Result};
use std::time::Duration;

/// H.264 video timescale, ticks per second.
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Opus always operates at 48 kHz on the wire.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Samples per AAC access unit.
const AAC_FRAME_SAMPLES: u64 = 1024;

/// H.264 track configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Config {
    /// Coded width in pixels.
    pub width: u32,
    /// Coded height in pixels.
    pub height: u32,
    /// AVCDecoderConfigurationRecord, served verbatim as the `avcC` payload.
    pub record: Vec<u8>,
}

/// AAC track configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AacConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// MPEG-4 audio object type (2 for AAC-LC).
    pub object_type: u8,
    /// AudioSpecificConfig bytes, carried in the `esds` decoder config.
    pub config: Vec<u8>,
}

/// Opus track configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusConfig {
    /// Output channel count.
    pub channels: u16,
    /// Pre-skip in 48 kHz samples, carried into the `dOps` box.
    pub pre_skip: u16,
}

/// Codec kind plus its configuration, immutable after `write_header`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecData {
    H264(H264Config),
    Aac(AacConfig),
    Opus(OpusConfig),
}

impl CodecData {
    /// Whether this is a video codec.
    pub fn is_video(&self) -> bool {
        matches!(self, CodecData::H264(_))
    }

    /// Media timescale for the track: 90 kHz for H.264, the sample rate for
    /// audio (48 kHz for Opus, which has no other wire rate).
    pub fn timescale(&self) -> u32 {
        match self {
            CodecData::H264(_) => VIDEO_TIMESCALE,
            CodecData::Aac(aac) => aac.sample_rate,
            CodecData::Opus(_) => OPUS_SAMPLE_RATE,
        }
    }

    /// RFC 6381 codec tag for playlists and manifests.
    pub fn tag(&self) -> Result<String> {
        match self {
            CodecData::H264(h264) => {
                if h264.record.len() < 4 {
                    return Err(Error::invalid_codec("AVC decoder record too short"));
                }
                Ok(format!(
                    "avc1.{:02x}{:02x}{:02x}",
                    h264.record[1], h264.record[2], h264.record[3]
                ))
            }
            CodecData::Aac(aac) => Ok(format!("mp4a.40.{}", aac.object_type)),
            CodecData::Opus(_) => Ok("opus".to_string()),
        }
    }

    /// Intrinsic duration of an audio packet, extracted from its payload.
    ///
    /// Video packets have no intrinsic duration (it comes from the successor
    /// DTS) and return an error.
    pub fn packet_duration(&self, payload: &[u8]) -> Result<Duration> {
        match self {
            CodecData::H264(_) => Err(Error::bad_audio("not an audio track")),
            CodecData::Aac(aac) => {
                if payload.is_empty() {
                    return Err(Error::bad_audio("empty AAC packet"));
                }
                // raw AAC: one access unit of 1024 samples per packet
                let ns = AAC_FRAME_SAMPLES * 1_000_000_000 / aac.sample_rate as u64;
                Ok(Duration::from_nanos(ns))
            }
            CodecData::Opus(_) => opus_packet_duration(payload),
        }
    }

    /// Reformat an H.264 payload into AVCC (length-prefixed) framing if it
    /// arrived with Annex B start codes. Payloads already in AVCC framing
    /// pass through untouched.
    pub fn reframe(&self, data: &mut Vec<u8>) -> Result<()> {
        let CodecData::H264(h264) = self else {
            return Ok(());
        };
        if !starts_with_start_code(data) {
            // already AVCC
            return Ok(());
        }
        let length_size = h264
            .record
            .get(4)
            .map(|b| (b & 3) as usize + 1)
            .ok_or_else(|| Error::invalid_codec("AVC decoder record too short"))?;
        let mut out = Vec::with_capacity(data.len() + 8);
        for nalu in split_annex_b(data) {
            let len = nalu.len();
            if length_size < 4 && len >= 1usize << (8 * length_size) {
                return Err(Error::invalid_codec("NALU too big for AVCC length size"));
            }
            match length_size {
                4 => out.extend_from_slice(&(len as u32).to_be_bytes()),
                3 => out.extend_from_slice(&(len as u32).to_be_bytes()[1..]),
                2 => out.extend_from_slice(&(len as u16).to_be_bytes()),
                1 => out.push(len as u8),
                _ => return Err(Error::invalid_codec("invalid AVCC length size")),
            }
            out.extend_from_slice(nalu);
        }
        *data = out;
        Ok(())
    }
}

fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Split an Annex B byte stream into NAL units, stripping start codes.
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut i = 0;
    let mut start = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                nalus.push(&data[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        nalus.push(&data[s..]);
    }
    nalus
}

/// Duration of an Opus packet from its TOC byte (RFC 6716 §3.1).
fn opus_packet_duration(payload: &[u8]) -> Result<Duration> {
    let toc = *payload
        .first()
        .ok_or_else(|| Error::bad_audio("empty Opus packet"))?;
    let config = toc >> 3;
    let frame_us: u64 = match config {
        0..=11 => [10_000, 20_000, 40_000, 60_000][(config & 3) as usize],
        12..=15 => [10_000, 20_000][(config & 1) as usize],
        _ => [2_500, 5_000, 10_000, 20_000][(config & 3) as usize],
    };
    let frames: u64 = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => {
            let count = payload
                .get(1)
                .map(|b| (b & 0x3f) as u64)
                .ok_or_else(|| Error::bad_audio("truncated Opus packet"))?;
            if count == 0 {
                return Err(Error::bad_audio("Opus packet with zero frames"));
            }
            count
        }
    };
    let total = frame_us * frames;
    if total > 120_000 {
        return Err(Error::bad_audio("Opus packet longer than 120ms"));
    }
    Ok(Duration::from_micros(total))
}

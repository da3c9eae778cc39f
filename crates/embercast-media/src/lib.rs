//! embercast-media: fragmented MP4 (CMAF) serialization and live packet
//! fragmenters.
//!
//! This crate turns a stream of timestamped, compressed media packets into
//! CMAF initialization blobs and `moof`/`mdat` fragments suitable for
//! low-latency HLS and DASH delivery.
//!
//! # Modules
//!
//! - [`codec`] - codec metadata: timescales, RFC 6381 tags, sample entries,
//!   audio packet durations, Annex B to AVCC reframing
//! - [`fmp4`] - ISO BMFF box serialization: init blobs, segment headers, and
//!   movie fragments
//! - [`frag`] - stateful fragmenters: per-track and multi-track
//! - [`timescale`] - nanosecond to media-timescale conversion

pub mod codec;
pub mod error;
pub mod fmp4;
pub mod frag;
pub mod packet;
pub mod timescale;

pub use codec::{AacConfig, CodecData, H264Config, OpusConfig};
pub use error::{Error, Result};
pub use frag::{MovieFragmenter, RawFragment, TrackFragmenter};
pub use packet::Packet;

//! Stateful packet fragmenters.
//!
//! [`TrackFragmenter`] turns one stream into CMAF fragments;
//! [`MovieFragmenter`] interleaves several streams into fragments that carry
//! one `moof`+`mdat` across all tracks.

mod movie;
mod track;

pub use movie::MovieFragmenter;
pub use track::TrackFragmenter;

use bytes::Bytes;
use std::time::Duration;

/// A marshalled fragment ready to be appended to a segment.
///
/// The byte buffer is immutable once produced; segment cursors and HTTP
/// responses share it without copying.
#[derive(Debug, Clone)]
pub struct RawFragment {
    /// Serialized bytes: optional `styp`, then `moof` + `mdat`.
    pub bytes: Bytes,
    /// Total byte length, retained after the buffer is released.
    pub length: usize,
    /// Elapsed time covered by the fragment.
    pub duration: Duration,
    /// Whether the fragment can be decoded without earlier fragments.
    pub independent: bool,
}

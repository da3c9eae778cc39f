//! HLS playlist text emission.
//!
//! Media playlists are rebuilt on every snapshot; the master playlist only
//! changes when bandwidth figures move, but is rebuilt alongside for
//! simplicity. Both are plain text assembled with `write!`.

use crate::names::Msn;
use crate::segment::Segment;
use md5::{Digest, Md5};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Trailing segments whose `#EXT-X-PART` lines are emitted.
pub const PART_SEGMENTS: usize = 3;

/// Inputs for one track's media playlist.
pub struct MediaPlaylist<'a> {
    /// Target duration, already rounded up to whole seconds.
    pub target: Duration,
    pub base_msn: Msn,
    pub base_dcn: i64,
    /// PART-TARGET, the configured fragment length.
    pub part_target: Duration,
    pub part_hold_back: Duration,
    /// URI of the track's init blob, e.g. `0abcinit.mp4`.
    pub init_uri: String,
    pub segments: &'a [Arc<Segment>],
}

impl MediaPlaylist<'_> {
    /// Render the playlist body.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("#EXTM3U\n#EXT-X-VERSION:9\n");
        let _ = writeln!(
            out,
            "#EXT-X-TARGETDURATION:{}",
            self.target.as_secs().max(1)
        );
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.base_msn);
        if self.base_dcn != 0 {
            let _ = writeln!(out, "#EXT-X-DISCONTINUITY-SEQUENCE:{}", self.base_dcn);
        }
        let _ = writeln!(
            out,
            "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.6},HOLD-BACK={:.6}",
            self.part_hold_back.as_secs_f64(),
            3.0 * self.target.as_secs_f64(),
        );
        let _ = writeln!(
            out,
            "#EXT-X-PART-INF:PART-TARGET={:.6}",
            self.part_target.as_secs_f64()
        );
        let _ = writeln!(out, "#EXT-X-MAP:URI=\"{}\"", self.init_uri);
        let n = self.segments.len();
        for (i, seg) in self.segments.iter().enumerate() {
            let include_parts = i + PART_SEGMENTS >= n;
            let include_preload = i + 1 == n;
            seg.format_into(&mut out, include_parts, include_preload);
        }
        out
    }
}

/// Render the master playlist: one `#EXT-X-STREAM-INF` for the video track
/// plus an `#EXT-X-MEDIA` rendition per audio track.
pub fn master_playlist(
    bandwidth: u64,
    codecs: &str,
    video_uri: &str,
    audio_uris: &[String],
) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("#EXTM3U\n");
    for uri in audio_uris {
        let _ = writeln!(
            out,
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"audio\",DEFAULT=YES,URI=\"{uri}\"",
        );
    }
    let audio_attr = if audio_uris.is_empty() {
        ""
    } else {
        "AUDIO=\"audio\","
    };
    let _ = writeln!(
        out,
        "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},{audio_attr}CODECS=\"{codecs}\"\n{video_uri}",
    );
    out
}

/// Weak ETag over a playlist body: a 128-bit digest, hex encoded.
pub fn playlist_etag(body: &[u8]) -> String {
    let digest = Md5::digest(body);
    let mut hex = String::with_capacity(32);
    for b in digest {
        let _ = write!(hex, "{b:02x}");
    }
    format!("W/\"{hex}\"")
}

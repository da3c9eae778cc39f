//! Multi-track fragmenter.

use crate::codec::CodecData;
use crate::error::{Error, Result};
use crate::fmp4::{boxes, marshal_fragment};
use crate::frag::{RawFragment, TrackFragmenter};
use crate::packet::Packet;
use std::time::Duration;

/// Interleaves several streams into fragments carrying a single
/// `moof`+`mdat` across all tracks.
///
/// Players assume one `moof`+`mdat` per chunk; audio/video interleave
/// happens inside a fragment, never as sibling fragments.
pub struct MovieFragmenter {
    tracks: Vec<TrackFragmenter>,
    vidx: usize,
    seq_num: u32,
    styp_pending: bool,
    init: Vec<u8>,
}

impl MovieFragmenter {
    /// Build a fragmenter over all streams. Exactly one video stream is
    /// required; it drives fragment timing.
    pub fn new(streams: &[CodecData]) -> Result<Self> {
        let mut vidx = None;
        for (i, codec) in streams.iter().enumerate() {
            if codec.is_video() {
                if vidx.is_some() {
                    return Err(Error::invalid_codec("more than one video track"));
                }
                vidx = Some(i);
            }
        }
        let vidx = vidx.ok_or_else(|| Error::invalid_codec("no video track found"))?;
        let tracks: Vec<TrackFragmenter> = streams
            .iter()
            .enumerate()
            .map(|(i, codec)| TrackFragmenter::new(i as u32 + 1, codec.clone()))
            .collect();
        let pairs: Vec<(u32, &CodecData)> =
            tracks.iter().map(|t| (t.track_id(), t.codec())).collect();
        let init = boxes::init_blob(&pairs);
        Ok(Self {
            tracks,
            vidx,
            seq_num: 0,
            styp_pending: false,
            init,
        })
    }

    /// The initialization blob covering every track.
    pub fn init_blob(&self) -> &[u8] {
        &self.init
    }

    /// Route a packet to its track's queue.
    pub fn write_packet(&mut self, pkt: Packet) -> Result<()> {
        let track = self
            .tracks
            .get_mut(pkt.track)
            .ok_or_else(|| Error::invalid_codec("packet track index out of range"))?;
        track.write_packet(pkt)
    }

    /// Elapsed duration of pending video, which decides when to flush.
    pub fn duration(&self) -> Duration {
        self.tracks[self.vidx].duration()
    }

    /// Produce one fragment spanning every track with queued packets.
    pub fn make_fragment(&mut self) -> Result<Option<RawFragment>> {
        let duration = self.duration();
        let independent = self.tracks[self.vidx]
            .first_pending()
            .map(|p| p.is_keyframe)
            .unwrap_or(false);
        let mut runs = Vec::with_capacity(self.tracks.len());
        for track in &mut self.tracks {
            if let Some((run, _, _)) = track.take_run()? {
                runs.push(run);
            }
        }
        if runs.is_empty() {
            return Ok(None);
        }
        self.seq_num += 1;
        let styp = if self.styp_pending {
            Some(boxes::write_styp())
        } else {
            None
        };
        self.styp_pending = false;
        let bytes = marshal_fragment(self.seq_num, styp.as_deref(), &runs);
        Ok(Some(RawFragment {
            length: bytes.len(),
            bytes,
            duration,
            independent,
        }))
    }

    /// Arm a leading `styp` on the next emitted fragment.
    pub fn new_segment(&mut self) {
        self.styp_pending = true;
    }
}

//! Single-track CMAF fragmenter.

use crate::codec::CodecData;
use crate::error::Result;
use crate::fmp4::{
    boxes, fragment::FragmentRun, fragment::RunEntry, marshal_fragment, SAMPLE_NON_KEYFRAME,
    SAMPLE_NO_DEPENDENCIES,
};
use crate::frag::RawFragment;
use crate::packet::Packet;
use crate::timescale;
use std::time::Duration;

/// Writes a single audio or video stream as a series of CMAF fragments.
///
/// The most recently written packet is held back in `tail` so that every
/// emitted sample has a successor DTS to derive its duration from. Audio is
/// the exception at fragment boundaries: the final audio sample's duration
/// comes from its own payload, because audio packets need not align with the
/// video-driven fragment grid.
pub struct TrackFragmenter {
    codec: CodecData,
    track_id: u32,
    timescale: u32,
    pending: Vec<Packet>,
    tail: Option<Packet>,
    seq_num: u32,
    styp_pending: bool,
}

impl TrackFragmenter {
    pub fn new(track_id: u32, codec: CodecData) -> Self {
        let timescale = codec.timescale();
        Self {
            codec,
            track_id,
            timescale,
            pending: Vec::new(),
            tail: None,
            seq_num: 0,
            styp_pending: false,
        }
    }

    pub fn codec(&self) -> &CodecData {
        &self.codec
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    /// Ticks per second of this track's media timeline.
    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    /// Initialization blob (`ftyp`+`moov`) describing just this track.
    pub fn init_blob(&self) -> Vec<u8> {
        boxes::init_blob(&[(self.track_id, &self.codec)])
    }

    /// Queue a packet for the next fragment.
    pub fn write_packet(&mut self, mut pkt: Packet) -> Result<()> {
        self.codec.reframe(&mut pkt.data)?;
        if let Some(tail) = &mut self.tail {
            if tail.dts == pkt.dts {
                // coalesce packets with the same timestamp; low-latency
                // encoders may split a keyframe into multiple NALUs emitted
                // as separate packets
                tail.data.extend_from_slice(&pkt.data);
                return Ok(());
            }
        }
        if let Some(prev) = self.tail.take() {
            self.pending.push(prev);
        }
        self.tail = Some(pkt);
        Ok(())
    }

    /// Elapsed time between the first queued packet and the held-back tail.
    pub fn duration(&self) -> Duration {
        match (self.pending.first(), &self.tail) {
            (Some(first), Some(tail)) => tail.dts.saturating_sub(first.dts),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn first_pending(&self) -> Option<&Packet> {
        self.pending.first()
    }

    /// Consume the pending queue into a track run, keeping the tail.
    pub(crate) fn take_run(&mut self) -> Result<Option<(FragmentRun, Duration, bool)>> {
        let (Some(first), Some(tail)) = (self.pending.first(), &self.tail) else {
            return Ok(None);
        };
        let start = first.dts;
        let start_dts = timescale::to_scale(start, self.timescale);
        let video = self.codec.is_video();
        let mut cur_dts = start_dts;
        let mut entries = Vec::with_capacity(self.pending.len());
        for (i, pkt) in self.pending.iter().enumerate() {
            // the successor DTS determines the duration; converting both
            // endpoints and differencing avoids accumulating rounding error
            let next = if let Some(n) = self.pending.get(i + 1) {
                n.dts
            } else if video {
                tail.dts
            } else {
                pkt.dts + self.codec.packet_duration(&pkt.data)?
            };
            let next_dts = timescale::to_scale(next, self.timescale);
            let flags = if video {
                if pkt.is_keyframe {
                    SAMPLE_NO_DEPENDENCIES
                } else {
                    SAMPLE_NON_KEYFRAME
                }
            } else {
                SAMPLE_NO_DEPENDENCIES
            };
            let cts = if pkt.cts_offset != 0 {
                let pts =
                    timescale::to_scale_signed(pkt.dts.as_nanos() as i64 + pkt.cts_offset, self.timescale);
                pts - cur_dts as i64
            } else {
                0
            };
            entries.push(RunEntry {
                duration: next_dts.saturating_sub(cur_dts) as u32,
                size: pkt.data.len() as u32,
                flags,
                cts,
            });
            cur_dts = next_dts;
        }
        let independent = !video || first.is_keyframe;
        let duration = tail.dts.saturating_sub(start);
        let payloads: Vec<Vec<u8>> = self.pending.drain(..).map(|p| p.data).collect();
        Ok(Some((
            FragmentRun {
                track_id: self.track_id,
                base_decode_time: start_dts,
                entries,
                payloads,
            },
            duration,
            independent,
        )))
    }

    /// Produce a fragment out of the currently queued packets, or `None` if
    /// nothing is pending yet.
    pub fn make_fragment(&mut self) -> Result<Option<RawFragment>> {
        let Some((run, duration, independent)) = self.take_run()? else {
            return Ok(None);
        };
        self.seq_num += 1;
        let styp = if self.styp_pending {
            Some(boxes::write_styp())
        } else {
            None
        };
        self.styp_pending = false;
        let bytes = marshal_fragment(self.seq_num, styp.as_deref(), &[run]);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AacConfig, H264Config};

    fn video_codec() -> CodecData {
        CodecData::H264(H264Config {
            width: 1280,
            height: 720,
            record: vec![0x01, 0x64, 0x00, 0x1f, 0xff],
        })
    }

    fn audio_codec() -> CodecData {
        CodecData::Aac(AacConfig {
            sample_rate: 48_000,
            channels: 2,
            object_type: 2,
            config: vec![0x11, 0x90],
        })
    }

    fn pkt(dts_ms: u64, key: bool, data: &[u8]) -> Packet {
        Packet {
            track: 0,
            dts: Duration::from_millis(dts_ms),
            is_keyframe: key,
            data: data.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_duration_needs_two_packets() {
        let mut f = TrackFragmenter::new(1, video_codec());
        assert_eq!(f.duration(), Duration::ZERO);
        f.write_packet(pkt(0, true, &[0, 0, 0, 1, 0x65])).unwrap();
        assert_eq!(f.duration(), Duration::ZERO);
        f.write_packet(pkt(33, false, &[0, 0, 0, 1, 0x41])).unwrap();
        assert_eq!(f.duration(), Duration::from_millis(33));
    }

    #[test]
    fn test_no_fragment_without_pending() {
        let mut f = TrackFragmenter::new(1, video_codec());
        assert!(f.make_fragment().unwrap().is_none());
        f.write_packet(pkt(0, true, &[0, 0, 0, 1, 0x65])).unwrap();
        // the only packet is held in the tail
        assert!(f.make_fragment().unwrap().is_none());
    }

    #[test]
    fn test_video_fragment_tiles_to_tail() {
        let mut f = TrackFragmenter::new(1, video_codec());
        for i in 0..4u64 {
            f.write_packet(pkt(i * 40, i == 0, &[0, 0, 0, 1, 0x41, i as u8]))
                .unwrap();
        }
        let frag = f.make_fragment().unwrap().unwrap();
        // pending held packets 0,40,80; tail is 120
        assert_eq!(frag.duration, Duration::from_millis(120));
        assert!(frag.independent);
        assert_eq!(frag.length, frag.bytes.len());
        // the next fragment starts from the previous tail
        f.write_packet(pkt(160, false, &[0, 0, 0, 1, 0x41])).unwrap();
        let frag = f.make_fragment().unwrap().unwrap();
        assert_eq!(frag.duration, Duration::from_millis(40));
        assert!(!frag.independent);
    }

    #[test]
    fn test_same_dts_coalesced() {
        let mut f = TrackFragmenter::new(1, video_codec());
        f.write_packet(pkt(0, true, &[0, 0, 0, 1, 0x65, 0xaa])).unwrap();
        f.write_packet(pkt(0, false, &[0, 0, 0, 1, 0x41, 0xbb])).unwrap();
        f.write_packet(pkt(40, false, &[0, 0, 0, 1, 0x41])).unwrap();
        let frag = f.make_fragment().unwrap().unwrap();
        // both NALUs of the split keyframe ended up in one sample
        assert_eq!(frag.duration, Duration::from_millis(40));
        let moof_size = u32::from_be_bytes(frag.bytes[0..4].try_into().unwrap()) as usize;
        let mdat_size = u32::from_be_bytes(
            frag.bytes[moof_size..moof_size + 4].try_into().unwrap(),
        ) as usize;
        // two 4-byte length prefixes plus 2+1 NALU bytes
        assert_eq!(mdat_size - 8, 4 + 2 + 4 + 2);
    }

    #[test]
    fn test_audio_terminal_duration_from_payload() {
        let mut f = TrackFragmenter::new(2, audio_codec());
        // 21.333ms stride at 48kHz
        for i in 0..3u64 {
            f.write_packet(pkt(i * 21, false, &[0x21; 8])).unwrap();
        }
        let frag = f.make_fragment().unwrap().unwrap();
        // audio fragments are always independent
        assert!(frag.independent);
        // pending 0,21; tail 42
        assert_eq!(frag.duration, Duration::from_millis(42));
    }

    #[test]
    fn test_audio_empty_payload_is_fatal() {
        let mut f = TrackFragmenter::new(2, audio_codec());
        f.write_packet(pkt(0, false, &[])).unwrap();
        f.write_packet(pkt(21, false, &[0x21; 8])).unwrap();
        assert!(f.make_fragment().is_err());
    }

    #[test]
    fn test_styp_armed_once() {
        let mut f = TrackFragmenter::new(1, video_codec());
        f.new_segment();
        f.write_packet(pkt(0, true, &[0, 0, 0, 1, 0x65])).unwrap();
        f.write_packet(pkt(40, false, &[0, 0, 0, 1, 0x41])).unwrap();
        let frag = f.make_fragment().unwrap().unwrap();
        assert_eq!(&frag.bytes[4..8], b"styp");
        f.write_packet(pkt(80, false, &[0, 0, 0, 1, 0x41])).unwrap();
        let frag = f.make_fragment().unwrap().unwrap();
        assert_eq!(&frag.bytes[4..8], b"moof");
    }

    #[test]
    fn test_init_blob_stable() {
        let f = TrackFragmenter::new(1, video_codec());
        assert_eq!(f.init_blob(), f.init_blob());
    }
}

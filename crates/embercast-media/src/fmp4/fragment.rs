//! Movie fragment (`moof` + `mdat`) assembly.
//!
//! A fragment carries one track run per participating track. Fields that are
//! identical across every sample of a run are hoisted into `tfhd` defaults
//! and omitted from `trun`; the run's `data_offset` is backpatched once the
//! full `moof` size is known.

use super::boxes::{self, fullbox_header, write_box, write_container_box};
use bytes::Bytes;

/// One sample of a track run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEntry {
    /// Duration in media-timescale ticks, from the successor DTS.
    pub duration: u32,
    /// Payload size in bytes.
    pub size: u32,
    /// Sample dependency flags.
    pub flags: u32,
    /// Composition offset in ticks, relative to the sample DTS.
    pub cts: i64,
}

/// Samples and payloads contributed by one track to a fragment.
#[derive(Debug)]
pub struct FragmentRun {
    pub track_id: u32,
    /// DTS of the first sample in media-timescale ticks.
    pub base_decode_time: u64,
    pub entries: Vec<RunEntry>,
    /// Sample payloads, parallel to `entries`.
    pub payloads: Vec<Vec<u8>>,
}

impl FragmentRun {
    fn payload_len(&self) -> u64 {
        self.payloads.iter().map(|p| p.len() as u64).sum()
    }
}

struct TrafLayout {
    bytes: Vec<u8>,
    /// Position of the trun data_offset field relative to the traf start.
    data_offset_pos: usize,
}

fn build_traf(run: &FragmentRun) -> TrafLayout {
    let entries = &run.entries;

    // Optimistically use the first sample's fields as defaults; clear a
    // default as soon as a sample disagrees. The first sample's flags can be
    // carried separately, so the flag default comes from the second sample.
    let mut default_duration = entries[0].duration;
    let mut default_size = entries[0].size;
    let mut default_flags = entries[0].flags;
    let first_flags = entries[0].flags;
    for (i, e) in entries.iter().enumerate().skip(1) {
        if e.duration != default_duration {
            default_duration = 0;
        }
        if e.size != default_size {
            default_size = 0;
        }
        if i == 1 {
            default_flags = e.flags;
        } else if e.flags != default_flags {
            default_flags = 0;
        }
    }

    let mut tfhd_flags = boxes::TFHD_DEFAULT_BASE_IS_MOOF;
    let mut trun_flags = boxes::TRUN_DATA_OFFSET;
    if default_duration != 0 {
        tfhd_flags |= boxes::TFHD_DEFAULT_DURATION;
    } else {
        trun_flags |= boxes::TRUN_SAMPLE_DURATION;
    }
    if default_size != 0 {
        tfhd_flags |= boxes::TFHD_DEFAULT_SIZE;
    } else {
        trun_flags |= boxes::TRUN_SAMPLE_SIZE;
    }
    if default_flags != 0 {
        tfhd_flags |= boxes::TFHD_DEFAULT_FLAGS;
        if first_flags != default_flags {
            trun_flags |= boxes::TRUN_FIRST_SAMPLE_FLAGS;
        }
    } else {
        trun_flags |= boxes::TRUN_SAMPLE_FLAGS;
    }
    let any_cts = entries.iter().any(|e| e.cts != 0);
    if any_cts {
        trun_flags |= boxes::TRUN_SAMPLE_CTS;
    }
    // negative composition offsets need the signed trun form
    let version: u8 = if entries.iter().any(|e| e.cts < 0) { 1 } else { 0 };

    let mut tfhd = Vec::with_capacity(20);
    tfhd.extend_from_slice(&fullbox_header(0, tfhd_flags));
    tfhd.extend_from_slice(&run.track_id.to_be_bytes());
    if tfhd_flags & boxes::TFHD_DEFAULT_DURATION != 0 {
        tfhd.extend_from_slice(&default_duration.to_be_bytes());
    }
    if tfhd_flags & boxes::TFHD_DEFAULT_SIZE != 0 {
        tfhd.extend_from_slice(&default_size.to_be_bytes());
    }
    if tfhd_flags & boxes::TFHD_DEFAULT_FLAGS != 0 {
        tfhd.extend_from_slice(&default_flags.to_be_bytes());
    }
    let tfhd = write_box(b"tfhd", &tfhd);

    let tfdt = boxes::write_tfdt(run.base_decode_time);

    let mut trun = Vec::with_capacity(12 + entries.len() * 16);
    trun.extend_from_slice(&fullbox_header(version, trun_flags));
    trun.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    // patched once the moof size is known
    trun.extend_from_slice(&0i32.to_be_bytes());
    if trun_flags & boxes::TRUN_FIRST_SAMPLE_FLAGS != 0 {
        trun.extend_from_slice(&first_flags.to_be_bytes());
    }
    for e in entries {
        if trun_flags & boxes::TRUN_SAMPLE_DURATION != 0 {
            trun.extend_from_slice(&e.duration.to_be_bytes());
        }
        if trun_flags & boxes::TRUN_SAMPLE_SIZE != 0 {
            trun.extend_from_slice(&e.size.to_be_bytes());
        }
        if trun_flags & boxes::TRUN_SAMPLE_FLAGS != 0 {
            trun.extend_from_slice(&e.flags.to_be_bytes());
        }
        if trun_flags & boxes::TRUN_SAMPLE_CTS != 0 {
            if version == 1 {
                trun.extend_from_slice(&(e.cts as i32).to_be_bytes());
            } else {
                trun.extend_from_slice(&(e.cts as u32).to_be_bytes());
            }
        }
    }
    let trun = write_box(b"trun", &trun);

    // data_offset sits after the trun header, version/flags and sample count
    let data_offset_pos = 8 + tfhd.len() + tfdt.len() + 8 + 4 + 4;
    let bytes = write_container_box(b"traf", &[&tfhd, &tfdt, &trun]);
    TrafLayout {
        bytes,
        data_offset_pos,
    }
}

/// Marshal one fragment: optional `styp`, then `moof` + `mdat`.
///
/// Runs must be non-empty and hold at least one entry each.
pub fn marshal_fragment(seq_num: u32, styp: Option<&[u8]>, runs: &[FragmentRun]) -> Bytes {
    let mfhd = boxes::write_mfhd(seq_num);
    let trafs: Vec<TrafLayout> = runs.iter().map(build_traf).collect();

    let traf_refs: Vec<&[u8]> = trafs.iter().map(|t| t.bytes.as_slice()).collect();
    let mut children: Vec<&[u8]> = Vec::with_capacity(1 + traf_refs.len());
    children.push(&mfhd);
    children.extend_from_slice(&traf_refs);
    let mut moof = write_container_box(b"moof", &children);

    let payload_len: u64 = runs.iter().map(|r| r.payload_len()).sum();
    let mdat_hdr = boxes::write_mdat_header(payload_len);

    // backpatch each run's data_offset now that the moof size is known
    let mut traf_abs = 8 + mfhd.len();
    let mut prior_payload = 0u64;
    for (traf, run) in trafs.iter().zip(runs) {
        let offset = (moof.len() + mdat_hdr.len()) as u64 + prior_payload;
        let pos = traf_abs + traf.data_offset_pos;
        moof[pos..pos + 4].copy_from_slice(&(offset as i32).to_be_bytes());
        traf_abs += traf.bytes.len();
        prior_payload += run.payload_len();
    }

    let styp_len = styp.map(|s| s.len()).unwrap_or(0);
    let mut out =
        Vec::with_capacity(styp_len + moof.len() + mdat_hdr.len() + payload_len as usize);
    if let Some(styp) = styp {
        out.extend_from_slice(styp);
    }
    out.extend_from_slice(&moof);
    out.extend_from_slice(&mdat_hdr);
    for run in runs {
        for payload in &run.payloads {
            out.extend_from_slice(payload);
        }
    }
    Bytes::from(out)
}

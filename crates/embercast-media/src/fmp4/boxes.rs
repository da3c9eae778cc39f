//! ISO BMFF box types and serialization primitives.
//!
//! Each box follows the standard layout: 4-byte size (big-endian u32),
//! 4-byte type (ASCII), then box-specific content. Only the subset needed
//! by the CMAF live profile is implemented.

use crate::codec::{CodecData, OPUS_SAMPLE_RATE};

/// Movie-level timescale used by `mvhd`.
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Sample depends on nothing (a sync sample).
pub const SAMPLE_NO_DEPENDENCIES: u32 = 0x0200_0000;
/// Sample depends on others and is not a sync sample.
pub const SAMPLE_NON_KEYFRAME: u32 = 0x0101_0000;

// tfhd flags
pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;
pub const TFHD_DEFAULT_DURATION: u32 = 0x0000_0008;
pub const TFHD_DEFAULT_SIZE: u32 = 0x0000_0010;
pub const TFHD_DEFAULT_FLAGS: u32 = 0x0000_0020;

// trun flags
pub const TRUN_DATA_OFFSET: u32 = 0x0000_0001;
pub const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x0000_0004;
pub const TRUN_SAMPLE_DURATION: u32 = 0x0000_0100;
pub const TRUN_SAMPLE_SIZE: u32 = 0x0000_0200;
pub const TRUN_SAMPLE_FLAGS: u32 = 0x0000_0400;
pub const TRUN_SAMPLE_CTS: u32 = 0x0000_0800;

// ---------------------------------------------------------------------------
// Low-level box writing helpers
// ---------------------------------------------------------------------------

/// Write a complete box: size (u32 BE) + type (4 ASCII bytes) + content.
pub(crate) fn write_box(box_type: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let size = (8 + content.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(content);
    out
}

/// Write a container box (size + type + children concatenated).
pub(crate) fn write_container_box(box_type: &[u8; 4], children: &[&[u8]]) -> Vec<u8> {
    let children_len: usize = children.iter().map(|c| c.len()).sum();
    let size = (8 + children_len) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    for child in children {
        out.extend_from_slice(child);
    }
    out
}

/// Full box header: version byte + 24-bit flags.
pub(crate) fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    let val = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    val.to_be_bytes()
}

// ---------------------------------------------------------------------------
// File-level headers: ftyp and styp
// ---------------------------------------------------------------------------

/// `ftyp` for the init blob. Major brand `iso6`, compatible `iso5`, `mp41`.
pub fn write_ftyp() -> Vec<u8> {
    let mut content = Vec::with_capacity(4 + 4 + 2 * 4);
    content.extend_from_slice(b"iso6");
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(b"iso5");
    content.extend_from_slice(b"mp41");
    write_box(b"ftyp", &content)
}

/// `styp` prepended to every media segment. Major brand `msdh`,
/// compatible `msix`.
pub fn write_styp() -> Vec<u8> {
    let mut content = Vec::with_capacity(4 + 4 + 4);
    content.extend_from_slice(b"msdh");
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(b"msix");
    write_box(b"styp", &content)
}

// ---------------------------------------------------------------------------
// moov tree
// ---------------------------------------------------------------------------

fn write_mvhd(next_track_id: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(112);
    // version 1, 64-bit times
    content.extend_from_slice(&fullbox_header(1, 0));
    // creation_time, modification_time
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    // duration unknown for a live fragmented movie
    content.extend_from_slice(&0u64.to_be_bytes());
    // rate 1.0 (16.16), volume 1.0 (8.8)
    content.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    content.extend_from_slice(&0x0100u16.to_be_bytes());
    // reserved
    content.extend_from_slice(&[0u8; 10]);
    write_identity_matrix(&mut content);
    // pre_defined
    content.extend_from_slice(&[0u8; 24]);
    content.extend_from_slice(&next_track_id.to_be_bytes());
    write_box(b"mvhd", &content)
}

fn write_identity_matrix(out: &mut Vec<u8>) {
    out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&0x4000_0000u32.to_be_bytes());
}

fn write_tkhd(track_id: u32, codec: &CodecData) -> Vec<u8> {
    let mut content = Vec::with_capacity(96);
    // version 1, flags = enabled | in_movie
    content.extend_from_slice(&fullbox_header(1, 3));
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&[0u8; 8]);
    // layer
    content.extend_from_slice(&0u16.to_be_bytes());
    // audio tracks join alternate group 1 so players pick exactly one
    let alternate_group: u16 = if codec.is_video() { 0 } else { 1 };
    content.extend_from_slice(&alternate_group.to_be_bytes());
    let volume: u16 = if codec.is_video() { 0 } else { 0x0100 };
    content.extend_from_slice(&volume.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_identity_matrix(&mut content);
    if let CodecData::H264(h264) = codec {
        content.extend_from_slice(&(h264.width << 16).to_be_bytes());
        content.extend_from_slice(&(h264.height << 16).to_be_bytes());
    } else {
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
    }
    write_box(b"tkhd", &content)
}

fn write_mdhd(timescale: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(36);
    content.extend_from_slice(&fullbox_header(1, 0));
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    // language: und
    content.extend_from_slice(&0x55C4u16.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_box(b"mdhd", &content)
}

fn write_hdlr(handler_type: &[u8; 4], name: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(24 + name.len() + 1);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(handler_type);
    content.extend_from_slice(&[0u8; 12]);
    content.extend_from_slice(name);
    content.push(0);
    write_box(b"hdlr", &content)
}

fn write_dinf() -> Vec<u8> {
    let url_box = {
        let mut c = Vec::with_capacity(4);
        // flags = 1: media data is in this file
        c.extend_from_slice(&fullbox_header(0, 1));
        write_box(b"url ", &c)
    };
    let dref_box = {
        let mut c = Vec::with_capacity(8 + url_box.len());
        c.extend_from_slice(&fullbox_header(0, 0));
        c.extend_from_slice(&1u32.to_be_bytes());
        c.extend_from_slice(&url_box);
        write_box(b"dref", &c)
    };
    write_container_box(b"dinf", &[&dref_box])
}

fn write_vmhd() -> Vec<u8> {
    let mut content = Vec::with_capacity(12);
    content.extend_from_slice(&fullbox_header(0, 1));
    content.extend_from_slice(&0u16.to_be_bytes());
    content.extend_from_slice(&[0u8; 6]);
    write_box(b"vmhd", &content)
}

fn write_smhd() -> Vec<u8> {
    let mut content = Vec::with_capacity(8);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u16.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_box(b"smhd", &content)
}

fn write_empty_table(box_type: &[u8; 4]) -> Vec<u8> {
    let mut content = Vec::with_capacity(8);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes());
    write_box(box_type, &content)
}

fn write_empty_stsz() -> Vec<u8> {
    let mut content = Vec::with_capacity(12);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes()); // sample size
    content.extend_from_slice(&0u32.to_be_bytes()); // sample count
    write_box(b"stsz", &content)
}

// ---------------------------------------------------------------------------
// Sample entries
// ---------------------------------------------------------------------------

fn write_avc1_entry(width: u32, height: u32, record: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(78 + record.len() + 8);
    // reserved + data reference index
    entry.extend_from_slice(&[0u8; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes());
    // pre_defined + reserved
    entry.extend_from_slice(&[0u8; 16]);
    entry.extend_from_slice(&(width as u16).to_be_bytes());
    entry.extend_from_slice(&(height as u16).to_be_bytes());
    // 72 dpi horizontal and vertical (16.16)
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    entry.extend_from_slice(&0u32.to_be_bytes());
    // frame count
    entry.extend_from_slice(&1u16.to_be_bytes());
    // compressor name
    entry.extend_from_slice(&[0u8; 32]);
    // depth, pre_defined -1
    entry.extend_from_slice(&0x0018u16.to_be_bytes());
    entry.extend_from_slice(&(-1i16).to_be_bytes());
    entry.extend_from_slice(&write_box(b"avcC", record));
    write_box(b"avc1", &entry)
}

fn audio_entry_prefix(sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut entry = Vec::with_capacity(28);
    entry.extend_from_slice(&[0u8; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes());
    entry.extend_from_slice(&[0u8; 8]);
    entry.extend_from_slice(&channels.to_be_bytes());
    // sample size in bits
    entry.extend_from_slice(&16u16.to_be_bytes());
    entry.extend_from_slice(&0u16.to_be_bytes());
    entry.extend_from_slice(&0u16.to_be_bytes());
    // sample rate (16.16)
    entry.extend_from_slice(&(sample_rate << 16).to_be_bytes());
    entry
}

fn write_mp4a_entry(sample_rate: u32, channels: u16, asc: &[u8]) -> Vec<u8> {
    let mut entry = audio_entry_prefix(sample_rate, channels);
    entry.extend_from_slice(&write_esds(asc));
    write_box(b"mp4a", &entry)
}

fn write_opus_entry(channels: u16, pre_skip: u16) -> Vec<u8> {
    let mut entry = audio_entry_prefix(OPUS_SAMPLE_RATE, channels);
    let mut dops = Vec::with_capacity(11);
    dops.push(0); // version
    dops.push(channels as u8);
    dops.extend_from_slice(&pre_skip.to_be_bytes());
    dops.extend_from_slice(&OPUS_SAMPLE_RATE.to_be_bytes());
    dops.extend_from_slice(&0i16.to_be_bytes()); // output gain
    dops.push(0); // channel mapping family
    entry.extend_from_slice(&write_box(b"dOps", &dops));
    write_box(b"Opus", &entry)
}

/// MPEG-4 descriptor: tag + expandable length + payload.
fn write_descriptor(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(tag);
    let mut len = payload.len();
    let mut stack = [0u8; 4];
    let mut n = 0;
    loop {
        stack[n] = (len & 0x7f) as u8;
        len >>= 7;
        n += 1;
        if len == 0 {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.push(stack[n] | 0x80);
    }
    out.push(stack[0]);
    out.extend_from_slice(payload);
    out
}

/// `esds` box: ES descriptor wrapping the AudioSpecificConfig.
fn write_esds(asc: &[u8]) -> Vec<u8> {
    let dec_specific = write_descriptor(0x05, asc);
    let mut dec_config = Vec::with_capacity(13 + dec_specific.len());
    dec_config.push(0x40); // objectTypeIndication: MPEG-4 audio
    dec_config.push(0x15); // audio stream
    dec_config.extend_from_slice(&[0u8; 3]); // buffer size
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // max bitrate
    dec_config.extend_from_slice(&0u32.to_be_bytes()); // avg bitrate
    dec_config.extend_from_slice(&dec_specific);
    let dec_config = write_descriptor(0x04, &dec_config);
    let sl_config = write_descriptor(0x06, &[0x02]);

    let mut es = Vec::with_capacity(3 + dec_config.len() + sl_config.len());
    es.extend_from_slice(&0u16.to_be_bytes()); // ES_ID
    es.push(0); // flags
    es.extend_from_slice(&dec_config);
    es.extend_from_slice(&sl_config);
    let es = write_descriptor(0x03, &es);

    let mut content = Vec::with_capacity(4 + es.len());
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&es);
    write_box(b"esds", &content)
}

fn write_stsd(codec: &CodecData) -> Vec<u8> {
    let entry = match codec {
        CodecData::H264(h264) => write_avc1_entry(h264.width, h264.height, &h264.record),
        CodecData::Aac(aac) => write_mp4a_entry(aac.sample_rate, aac.channels, &aac.config),
        CodecData::Opus(opus) => write_opus_entry(opus.channels, opus.pre_skip),
    };
    let mut content = Vec::with_capacity(8 + entry.len());
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&entry);
    write_box(b"stsd", &content)
}

fn write_stbl(codec: &CodecData) -> Vec<u8> {
    let stsd = write_stsd(codec);
    let stts = write_empty_table(b"stts");
    let stsc = write_empty_table(b"stsc");
    let stsz = write_empty_stsz();
    let stco = write_empty_table(b"stco");
    write_container_box(b"stbl", &[&stsd, &stts, &stsc, &stsz, &stco])
}

fn write_trak(track_id: u32, codec: &CodecData) -> Vec<u8> {
    let tkhd = write_tkhd(track_id, codec);
    let mdhd = write_mdhd(codec.timescale());
    let (handler, name, mhd): (&[u8; 4], &[u8], Vec<u8>) = if codec.is_video() {
        (b"vide", b"VideoHandler", write_vmhd())
    } else {
        (b"soun", b"SoundHandler", write_smhd())
    };
    let hdlr = write_hdlr(handler, name);
    let dinf = write_dinf();
    let stbl = write_stbl(codec);
    let minf = write_container_box(b"minf", &[&mhd, &dinf, &stbl]);
    let mdia = write_container_box(b"mdia", &[&mdhd, &hdlr, &minf]);
    write_container_box(b"trak", &[&tkhd, &mdia])
}

fn write_trex(track_id: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(24);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes()); // sample description index
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    write_box(b"trex", &content)
}

/// Build the initialization blob for a set of tracks: `ftyp + moov`.
///
/// The blob is produced once per publish and must never change afterwards;
/// callers detect layout drift by comparing rebuilt bytes.
pub fn init_blob(tracks: &[(u32, &CodecData)]) -> Vec<u8> {
    let next_track_id = tracks.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1;
    let mvhd = write_mvhd(next_track_id);
    let traks: Vec<Vec<u8>> = tracks
        .iter()
        .map(|(id, codec)| write_trak(*id, codec))
        .collect();
    let trexes: Vec<Vec<u8>> = tracks.iter().map(|(id, _)| write_trex(*id)).collect();
    let trex_refs: Vec<&[u8]> = trexes.iter().map(|t| t.as_slice()).collect();
    let mvex = write_container_box(b"mvex", &trex_refs);

    let mut children: Vec<&[u8]> = Vec::with_capacity(2 + traks.len());
    children.push(&mvhd);
    for trak in &traks {
        children.push(trak);
    }
    children.push(&mvex);
    let moov = write_container_box(b"moov", &children);

    let ftyp = write_ftyp();
    let mut out = Vec::with_capacity(ftyp.len() + moov.len());
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);
    out
}

// ---------------------------------------------------------------------------
// Fragment boxes
// ---------------------------------------------------------------------------

pub(crate) fn write_mfhd(sequence_number: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(8);
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&sequence_number.to_be_bytes());
    write_box(b"mfhd", &content)
}

pub(crate) fn write_tfdt(base_media_decode_time: u64) -> Vec<u8> {
    let mut content = Vec::with_capacity(12);
    content.extend_from_slice(&fullbox_header(1, 0));
    content.extend_from_slice(&base_media_decode_time.to_be_bytes());
    write_box(b"tfdt", &content)
}

/// `mdat` header for the given payload size (extended form above 4 GiB).
pub(crate) fn write_mdat_header(data_size: u64) -> Vec<u8> {
    if data_size + 8 > u32::MAX as u64 {
        let mut hdr = Vec::with_capacity(16);
        hdr.extend_from_slice(&1u32.to_be_bytes());
        hdr.extend_from_slice(b"mdat");
        hdr.extend_from_slice(&(data_size + 16).to_be_bytes());
        hdr
    } else {
        let mut hdr = Vec::with_capacity(8);
        hdr.extend_from_slice(&((data_size + 8) as u32).to_be_bytes());
        hdr.extend_from_slice(b"mdat");
        hdr
    }
}

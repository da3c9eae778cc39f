//! A single live segment: a growing list of parts backed by a temp file.
//!
//! The ingest side appends fragments and eventually finalizes or releases
//! the segment; any number of readers concurrently fetch single parts,
//! whole bodies, or trickle the segment as it grows. Mutable state sits
//! behind a reader-writer lock; a watch channel stands in for the condition
//! variable, bumped on every append, finalize and release so waiting
//! readers re-check state after each wake.
//!
//! Part buffers are dropped at finalization; the backing file, written on
//! every append, serves all later reads by positional I/O. The file is an
//! anonymous temp file, so releasing the segment is just dropping the
//! handle.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use embercast_media::RawFragment;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One fragment that has been appended to a segment.
#[derive(Debug)]
struct Part {
    /// Resident bytes; dropped once the segment is finalized.
    bytes: Option<Bytes>,
    length: usize,
    duration: Duration,
    independent: bool,
}

#[derive(Debug, Default)]
struct SegmentState {
    parts: Vec<Part>,
    file: Option<Arc<File>>,
    size: u64,
    finalized: bool,
    released: bool,
    dur: Duration,
}

/// Result of asking for the next readable chunk of a segment.
#[derive(Debug)]
pub enum Chunk {
    /// Bytes of the requested part.
    Data(Bytes),
    /// The part is not there yet; wait on [`Segment::subscribe`].
    Wait,
    /// The segment is final and fully consumed.
    Finished,
    /// The segment was released (or its file failed); stop reading.
    Gone,
}

/// A single HLS segment addressable by `(track, msn)`.
#[derive(Debug)]
pub struct Segment {
    base: String,
    suffix: String,
    start: Duration,
    dcn: bool,
    program_time: Option<String>,
    state: RwLock<SegmentState>,
    cond: watch::Sender<u64>,
}

impl Segment {
    /// Create a live segment with its backing file in `work_dir`.
    ///
    /// `estimated_dur` seeds the duration until finalization fixes it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: String,
        suffix: String,
        work_dir: &Path,
        start: Duration,
        dcn: bool,
        program_time: Option<DateTime<Utc>>,
        estimated_dur: Duration,
    ) -> io::Result<Segment> {
        let file = tempfile::tempfile_in(work_dir)?;
        let (cond, _) = watch::channel(0);
        Ok(Segment {
            base,
            suffix,
            start,
            dcn,
            program_time: program_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            state: RwLock::new(SegmentState {
                file: Some(Arc::new(file)),
                dur: estimated_dur,
                ..Default::default()
            }),
            cond,
        })
    }

    /// Basename without suffix, e.g. `0abc4f17`.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Time at which the segment begins.
    pub fn start(&self) -> Duration {
        self.start
    }

    /// Whether the segment immediately follows a change in stream
    /// parameters.
    pub fn discontinuous(&self) -> bool {
        self.dcn
    }

    /// Segment duration: the finalized value, or the estimate while live.
    pub fn duration(&self) -> Duration {
        self.state.read().dur
    }

    /// Whether the segment is complete.
    pub fn is_final(&self) -> bool {
        self.state.read().finalized
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    /// Number of parts currently in the segment.
    pub fn parts_len(&self) -> usize {
        self.state.read().parts.len()
    }

    /// Finalized byte/duration totals, for bandwidth accounting.
    pub fn final_stats(&self) -> Option<(u64, Duration)> {
        let st = self.state.read();
        st.finalized.then_some((st.size, st.dur))
    }

    /// Subscribe to state changes (appends, finalize, release).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.cond.subscribe()
    }

    /// Append a complete fragment. The buffer must not be modified
    /// afterwards. Called only by the ingest thread.
    pub fn append(&self, frag: &RawFragment) -> io::Result<()> {
        let (file, offset) = {
            let mut st = self.state.write();
            let offset = st.size;
            st.parts.push(Part {
                bytes: Some(frag.bytes.clone()),
                length: frag.length,
                duration: frag.duration,
                independent: frag.independent,
            });
            st.size += frag.length as u64;
            (st.file.clone(), offset)
        };
        self.cond.send_modify(|v| *v += 1);
        match file {
            Some(file) => file.write_all_at(&frag.bytes, offset),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "segment already released",
            )),
        }
    }

    /// Mark the segment complete and drop resident part buffers; later
    /// reads come from the file. The duration estimate is kept if
    /// timestamps went backwards (stream restart).
    pub fn finalize(&self, next_segment: Duration) {
        {
            let mut st = self.state.write();
            st.finalized = true;
            if next_segment > self.start {
                st.dur = next_segment - self.start;
            }
            for part in &mut st.parts {
                part.bytes = None;
            }
        }
        self.cond.send_modify(|v| *v += 1);
    }

    /// Drop the backing storage and unblock all waiting readers.
    pub fn release(&self) {
        {
            let mut st = self.state.write();
            st.released = true;
            st.file = None;
            st.size = 0;
        }
        self.cond.send_modify(|v| *v += 1);
    }

    /// Fetch part `idx` if it is readable right now.
    ///
    /// The lock is dropped before any file I/O; resident buffers are handed
    /// out as cheap clones.
    pub fn chunk_at(&self, idx: usize) -> Chunk {
        enum Src {
            Mem(Bytes),
            File(Arc<File>, u64, usize),
        }
        let src = {
            let st = self.state.read();
            if let Some(part) = st.parts.get(idx) {
                if let Some(bytes) = &part.bytes {
                    Src::Mem(bytes.clone())
                } else if let Some(file) = &st.file {
                    let offset: u64 = st.parts[..idx].iter().map(|p| p.length as u64).sum();
                    Src::File(file.clone(), offset, part.length)
                } else {
                    return Chunk::Gone;
                }
            } else if st.released {
                return Chunk::Gone;
            } else if st.finalized {
                return Chunk::Finished;
            } else {
                return Chunk::Wait;
            }
        };
        match src {
            Src::Mem(bytes) => Chunk::Data(bytes),
            Src::File(file, offset, length) => {
                let mut buf = vec![0u8; length];
                match file.read_exact_at(&mut buf, offset) {
                    Ok(()) => Chunk::Data(Bytes::from(buf)),
                    Err(err) => {
                        tracing::warn!(segment = %self.base, %err, "segment file read failed");
                        Chunk::Gone
                    }
                }
            }
        }
    }

    /// Wait until part `idx` is readable, the segment completes, or it goes
    /// away. Backbone of the trickle read path.
    pub async fn next_chunk(&self, idx: usize) -> Chunk {
        let mut rx = self.subscribe();
        loop {
            // mark the current version seen before checking so a concurrent
            // append cannot be missed
            rx.borrow_and_update();
            match self.chunk_at(idx) {
                Chunk::Wait => {}
                chunk => return chunk,
            }
            if rx.changed().await.is_err() {
                return Chunk::Gone;
            }
        }
    }

    /// Append this segment's playlist lines.
    pub fn format_into(&self, out: &mut String, include_parts: bool, include_preload_hint: bool) {
        let st = self.state.read();
        if !st.finalized && (!include_parts || st.parts.is_empty()) {
            return;
        }
        if let Some(pt) = &self.program_time {
            let _ = writeln!(out, "#EXT-X-PROGRAM-DATE-TIME:{pt}");
        }
        if self.dcn {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        if include_parts {
            for (i, part) in st.parts.iter().enumerate() {
                let independent = if part.independent {
                    "INDEPENDENT=YES,"
                } else {
                    ""
                };
                let _ = writeln!(
                    out,
                    "#EXT-X-PART:DURATION={:.6},{}URI=\"{}.{}{}\"",
                    part.duration.as_secs_f64(),
                    independent,
                    self.base,
                    i,
                    self.suffix,
                );
            }
        }
        if include_preload_hint {
            let _ = writeln!(
                out,
                "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}.{}{}\"",
                self.base,
                st.parts.len(),
                self.suffix,
            );
        }
        if st.finalized {
            let _ = writeln!(
                out,
                "#EXTINF:{:.6},\n{}{}",
                st.dur.as_secs_f64(),
                self.base,
                self.suffix,
            );
        }
    }
}

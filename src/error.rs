//! Error types for the embercast publisher.

use std::io;
use thiserror::Error;

/// Result type for publisher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the ingest side.
///
/// HTTP-side failures never appear here; they map straight to status codes
/// in the request handlers.
#[derive(Debug, Error)]
pub enum Error {
    /// The publisher has been closed; no further packets are accepted.
    #[error("publisher is closed")]
    Closed,

    /// `write_packet` was called before `write_header`.
    #[error("write_header must be called before writing packets")]
    HeaderRequired,

    /// The stream set does not contain exactly one video track.
    #[error("exactly one video stream is required")]
    NoPrimary,

    /// `write_header` was called again with codec data that produces a
    /// different initialization blob.
    #[error("can't change fMP4 layout after the first header")]
    LayoutDrift,

    /// Fragmenting failed; fatal to the publish.
    #[error(transparent)]
    Media(#[from] embercast_media::Error),

    /// Writing a segment's backing file failed; fatal to the publish.
    #[error("segment write failed: {0}")]
    DiskWrite(#[source] io::Error),

    /// Other I/O failure, e.g. creating the work directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

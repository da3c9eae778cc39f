//! Error types for embercast-media.

use std::io;
use thiserror::Error;

/// Result type for embercast-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for embercast-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Codec configuration is malformed or inconsistent with the bitstream.
    #[error("invalid codec configuration: {0}")]
    InvalidCodecConfig(String),

    /// The last audio packet of a fragment could not be parsed for its
    /// intrinsic duration.
    #[error("last audio packet in fragment cannot be parsed: {0}")]
    UnparseableAudioPacket(String),

    /// A header rebuild produced a different fMP4 layout.
    #[error("can't change fMP4 layout after the first header")]
    LayoutDrift,

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create an invalid codec configuration error.
    pub fn invalid_codec(msg: impl Into<String>) -> Self {
        Self::InvalidCodecConfig(msg.into())
    }

    /// Create an unparseable audio packet error.
    pub fn bad_audio(msg: impl Into<String>) -> Self {
        Self::UnparseableAudioPacket(msg.into())
    }
}

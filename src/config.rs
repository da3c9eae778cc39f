//! Publisher configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fallback for [`PublisherConfig::initial_duration`].
pub const DEFAULT_INITIAL_DURATION: Duration = Duration::from_secs(5);
/// Fallback for [`PublisherConfig::buffer_length`].
pub const DEFAULT_BUFFER_LENGTH: Duration = Duration::from_secs(60);
/// Fallback for [`PublisherConfig::fragment_length`].
pub const DEFAULT_FRAGMENT_LENGTH: Duration = Duration::from_millis(200);

/// Which playlist surfaces the publisher exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One muxed track combining audio and video in a single playlist.
    /// DASH is disabled.
    SingleTrack,
    /// One CMAF track per stream plus a master playlist selecting them.
    SeparateTracks,
    /// Both of the above, for players that cannot consume separate-track
    /// HLS.
    #[default]
    SingleAndSeparate,
}

impl Mode {
    /// Map the wrapper-facing numeric flag (`--mode={0,1,2}`).
    pub fn from_flag(v: u8) -> Option<Mode> {
        match v {
            0 => Some(Mode::SingleTrack),
            1 => Some(Mode::SeparateTracks),
            2 => Some(Mode::SingleAndSeparate),
            _ => None,
        }
    }
}

/// Tunables for a single publish.
///
/// Zero durations mean "use the default"; the effective value accessors
/// apply the fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Guess for the playlist TARGETDURATION until the first segment is
    /// complete.
    pub initial_duration: Duration,
    /// Approximate wall-clock span of the segment window. Old segments are
    /// trimmed once the playlist exceeds this length.
    pub buffer_length: Duration,
    /// Partial fragments are flushed at this cadence, bounding the latency
    /// of LL-HLS parts.
    pub fragment_length: Duration,
    /// PART-HOLD-BACK advertised to players. Defaults to
    /// `max(1s, 3 * fragment_length)`.
    pub part_hold_back: Option<Duration>,
    /// Directory for segment overflow files. The publisher creates a
    /// private temp dir inside it (system temp dir if unset).
    pub work_dir: Option<PathBuf>,
    /// Playlist surface selection.
    pub mode: Mode,
}

impl PublisherConfig {
    pub fn initial_duration(&self) -> Duration {
        if self.initial_duration.is_zero() {
            DEFAULT_INITIAL_DURATION
        } else {
            self.initial_duration
        }
    }

    pub fn buffer_length(&self) -> Duration {
        if self.buffer_length.is_zero() {
            DEFAULT_BUFFER_LENGTH
        } else {
            self.buffer_length
        }
    }

    pub fn fragment_length(&self) -> Duration {
        if self.fragment_length.is_zero() {
            DEFAULT_FRAGMENT_LENGTH
        } else {
            self.fragment_length
        }
    }

    pub fn part_hold_back(&self) -> Duration {
        self.part_hold_back
            .unwrap_or_else(|| (3 * self.fragment_length()).max(Duration::from_secs(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_zero_fields() {
        let cfg = PublisherConfig::default();
        assert_eq!(cfg.initial_duration(), DEFAULT_INITIAL_DURATION);
        assert_eq!(cfg.buffer_length(), DEFAULT_BUFFER_LENGTH);
        assert_eq!(cfg.fragment_length(), DEFAULT_FRAGMENT_LENGTH);
        assert_eq!(cfg.part_hold_back(), Duration::from_secs(1));
    }

    #[test]
    fn test_part_hold_back_scales_with_fragment_length() {
        let cfg = PublisherConfig {
            fragment_length: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(cfg.part_hold_back(), Duration::from_millis(1500));
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(Mode::from_flag(0), Some(Mode::SingleTrack));
        assert_eq!(Mode::from_flag(1), Some(Mode::SeparateTracks));
        assert_eq!(Mode::from_flag(2), Some(Mode::SingleAndSeparate));
        assert_eq!(Mode::from_flag(3), None);
    }
}

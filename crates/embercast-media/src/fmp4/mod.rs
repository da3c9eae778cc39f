//! Fragmented MP4 (ISO BMFF) serialization.
//!
//! [`boxes`] provides the individual box writers, [`fragment`] assembles
//! complete `moof`/`mdat` fragments with backpatched data offsets.

pub mod boxes;
pub mod fragment;

pub use boxes::{init_blob, write_styp, SAMPLE_NON_KEYFRAME, SAMPLE_NO_DEPENDENCIES};
pub use fragment::{marshal_fragment, FragmentRun, RunEntry};

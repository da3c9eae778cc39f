//! embercast - live low-latency HLS/DASH origin publisher.
//!
//! One upstream producer feeds compressed audio and video packets through
//! [`Publisher::write_packet`]; the publisher republishes the stream over
//! HTTP as an LL-HLS playlist family, an optional DASH manifest, CMAF init
//! blobs and fragmented-MP4 media segments addressable by URL. Requests can
//! block until a future segment or part exists (`_HLS_msn`/`_HLS_part`),
//! and a segment still being produced is trickled to clients as parts are
//! appended.
//!
//! # Usage
//!
//! ```rust,ignore
//! use embercast::{Publisher, PublisherConfig};
//! use std::sync::Arc;
//!
//! let publisher = Arc::new(Publisher::new(PublisherConfig::default()));
//! publisher.write_header(&streams)?;
//!
//! // Add to your Axum router
//! let app = axum::Router::new()
//!     .nest_service("/hls", embercast::router(publisher.clone()));
//!
//! // Ingest loop (single-threaded by contract)
//! for packet in packets {
//!     publisher.write_packet(packet)?;
//! }
//! publisher.close();
//! ```

pub mod blocking;
pub mod config;
pub mod dash;
pub mod error;
pub mod names;
pub mod playlist;
pub mod publisher;
pub mod rate;
pub mod segment;
pub mod serve;
pub mod snapshot;

pub use config::{Mode, PublisherConfig};
pub use error::{Error, Result};
pub use publisher::Publisher;
pub use serve::router;

// The media layer is part of the public ingest surface.
pub use embercast_media as media;
pub use embercast_media::{CodecData, Packet};

//! Shared harness for publisher integration tests.

#![allow(dead_code)]

use embercast::media::{AacConfig, CodecData, H264Config, Packet};
use embercast::{Publisher, PublisherConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// 30 fps frame stride.
pub const VIDEO_STRIDE: Duration = Duration::from_nanos(33_333_333);
/// 1024-sample AAC packet stride at 48 kHz.
pub const AUDIO_STRIDE: Duration = Duration::from_nanos(21_333_333);

pub struct TestHarness {
    pub publisher: Arc<Publisher>,
}

impl TestHarness {
    pub fn new(cfg: PublisherConfig) -> TestHarness {
        TestHarness {
            publisher: Arc::new(Publisher::new(cfg)),
        }
    }

    /// Harness plus a real HTTP listener on an ephemeral port.
    pub async fn with_server(cfg: PublisherConfig) -> (TestHarness, SocketAddr) {
        static TRACING: std::sync::Once = std::sync::Once::new();
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
        let h = TestHarness::new(cfg);
        let app = embercast::router(h.publisher.clone())
            .layer(tower_http::trace::TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (h, addr)
    }

    pub fn write_header(&self) {
        self.publisher.write_header(&streams()).unwrap();
    }

    /// Feed one GOP: a keyframe at `start`, then 30fps non-key frames and
    /// 48kHz audio until `start + len`.
    pub fn feed_gop(&self, start: Duration, len: Duration) {
        let end = start + len;
        self.publisher.write_packet(video_packet(start, true)).unwrap();
        let mut v = start + VIDEO_STRIDE;
        let mut a = start;
        while v < end || a < end {
            if a <= v && a < end {
                self.publisher.write_packet(audio_packet(a)).unwrap();
                a += AUDIO_STRIDE;
            } else {
                self.publisher.write_packet(video_packet(v, false)).unwrap();
                v += VIDEO_STRIDE;
            }
        }
    }
}

/// The standard test stream pair: 1080p H.264 plus 48 kHz stereo AAC.
pub fn streams() -> Vec<CodecData> {
    vec![
        CodecData::H264(H264Config {
            width: 1920,
            height: 1080,
            // profile high 4.0, 4-byte NALU lengths
            record: vec![0x01, 0x64, 0x00, 0x28, 0xff, 0xe1, 0x00, 0x00],
        }),
        CodecData::Aac(AacConfig {
            sample_rate: 48_000,
            channels: 2,
            object_type: 2,
            config: vec![0x11, 0x90],
        }),
    ]
}

/// AVCC-framed video packet.
pub fn video_packet(dts: Duration, key: bool) -> Packet {
    let nalu: &[u8] = if key {
        &[0x65, 0x88, 0x84, 0x00, 0x10]
    } else {
        &[0x41, 0x9a, 0x02, 0x04]
    };
    let mut data = Vec::with_capacity(4 + nalu.len());
    data.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
    data.extend_from_slice(nalu);
    Packet {
        track: 0,
        dts,
        is_keyframe: key,
        data,
        ..Default::default()
    }
}

/// Raw AAC packet (one 1024-sample access unit).
pub fn audio_packet(dts: Duration) -> Packet {
    Packet {
        track: 1,
        dts,
        data: vec![0x21, 0x10, 0x04, 0x60, 0x8c, 0x1c],
        ..Default::default()
    }
}

//! Blocking-reload semantics over a real listener: `_HLS_msn`/`_HLS_part`
//! waits, ETag waits, timeouts and close behavior.

mod common;

use common::{video_packet, TestHarness, VIDEO_STRIDE};
use embercast::{Mode, PublisherConfig};
use std::time::{Duration, Instant};

fn cfg() -> PublisherConfig {
    PublisherConfig {
        initial_duration: Duration::from_secs(1),
        fragment_length: Duration::from_millis(200),
        mode: Mode::SeparateTracks,
        ..Default::default()
    }
}

async fn started() -> (TestHarness, String) {
    let (h, addr) = TestHarness::with_server(cfg()).await;
    h.write_header();
    h.feed_gop(Duration::ZERO, Duration::from_secs(1));
    h.feed_gop(Duration::from_secs(1), Duration::from_secs(1));
    let pid = h.publisher.load().pid.clone();
    (h, format!("http://{addr}/hls/0{pid}"))
}

#[tokio::test]
async fn distant_future_is_rejected() {
    let (h, base) = started().await;
    let complete = h.publisher.load().complete.msn;
    let resp = reqwest::get(format!("{base}.m3u8?_HLS_msn={}", complete + 4))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body = resp.text().await.unwrap();
    assert!(body.contains("distant future"), "body: {body}");
}

#[tokio::test]
async fn malformed_block_params_are_rejected() {
    let (_h, base) = started().await;
    let resp = reqwest::get(format!("{base}.m3u8?_HLS_msn=abc"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("invalid _HLS_msn"));

    let resp = reqwest::get(format!("{base}.m3u8?_HLS_msn=1&_HLS_part=-1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("invalid _HLS_part"));
}

#[tokio::test]
async fn blocking_reload_unblocks_on_publish() {
    let (h, base) = started().await;
    let want = h.publisher.load().complete.msn + 1;
    let url = format!("{base}.m3u8?_HLS_msn={want}");
    let request = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // next keyframe finalizes the live segment, completing `want`
    h.feed_gop(Duration::from_secs(2), Duration::from_secs(1));

    let start = Instant::now();
    let resp = request.await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("#EXTM3U"));
    assert!(h.publisher.load().complete.msn >= want);
}

#[tokio::test]
async fn part_blocking_unblocks_on_flush() {
    let (h, base) = started().await;
    let snap = h.publisher.load();
    let live_msn = snap.complete.msn + 1;
    let next_part = snap.complete.part;
    let url = format!("{base}.m3u8?_HLS_msn={live_msn}&_HLS_part={next_part}");
    let request = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // a few more frames cross the fragment deadline and flush a new part
    for i in 1..=8u32 {
        h.publisher
            .write_packet(video_packet(
                Duration::from_secs(2) + VIDEO_STRIDE * i,
                false,
            ))
            .unwrap();
    }
    let resp = request.await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(h
        .publisher
        .load()
        .complete
        .satisfies(embercast::names::PartMsn {
            msn: live_msn,
            part: next_part,
        }));
}

#[tokio::test]
async fn blocking_reload_times_out_with_404() {
    let (h, base) = started().await;
    let want = h.publisher.load().complete.msn + 1;
    let start = Instant::now();
    let resp = reqwest::get(format!("{base}.m3u8?_HLS_msn={want}"))
        .await
        .unwrap();
    // ceiling is initial_duration + 1s
    assert_eq!(resp.status(), 404);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn etag_conditional_get_waits_for_change() {
    let (h, base) = started().await;
    let resp = reqwest::get(format!("{base}.m3u8")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let etag = resp
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = resp.text().await.unwrap();

    let client = reqwest::Client::new();
    let url = format!("{base}.m3u8");
    let cond = {
        let etag = etag.clone();
        tokio::spawn(async move {
            client
                .get(url)
                .header("If-None-Match", etag)
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // flush a part so the playlist body changes
    for i in 1..=8u32 {
        h.publisher
            .write_packet(video_packet(
                Duration::from_secs(2) + VIDEO_STRIDE * i,
                false,
            ))
            .unwrap();
    }
    let resp = cond.await.unwrap();
    assert_eq!(resp.status(), 200);
    let new_etag = resp.headers().get("etag").unwrap().to_str().unwrap();
    assert_ne!(new_etag, etag);
    assert_ne!(resp.text().await.unwrap(), body);
}

#[tokio::test]
async fn close_wakes_blocked_readers_with_404() {
    let (h, base) = started().await;
    let want = h.publisher.load().complete.msn + 1;
    let url = format!("{base}.m3u8?_HLS_msn={want}");
    let request = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.publisher.close();
    let resp = request.await.unwrap();
    assert_eq!(resp.status(), 404);
}

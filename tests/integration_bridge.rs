//! Cross-module integration tests for the session control plane.
//!
//! These exercise the durable-store/alarm machinery and the media codecs
//! end to end, without a network. The live scenarios at the bottom require
//! a running server plus SFU and speech-provider credentials; run them with:
//! cargo test --test integration_bridge -- --ignored
//!
//! Set MEDIABRIDGE_TEST_URL to override the server URL
//! (default: http://localhost:8080)

use bytes::Bytes;
use mediabridge::state::StatePatch;
use mediabridge::store::{spawn_alarm_task, StoreBackend};
use mediabridge::{now_ms, packet, send_queue, SendQueue, StateStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Durable state across restarts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("mediabridge-it-{}", uuid()));

    // First lifetime: a session connects and arms deadlines.
    {
        let store = StateStore::restore(StoreBackend::file(&dir, "s1"), "s1")
            .await
            .unwrap();
        store
            .update(
                StatePatch {
                    session_name: Some("s1".into()),
                    upstream_session_id: Some(Some("sfu-abc".into())),
                    mic_track_name: Some(Some("mic-1".into())),
                    allow_reconnect: Some(true),
                    keep_alive_deadline: Some(Some(now_ms() + 5000)),
                    inactivity_deadline: Some(Some(now_ms() + 600_000)),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
    }

    // Second lifetime: everything is back, alarm included.
    let store = StateStore::restore(StoreBackend::file(&dir, "s1"), "s1")
        .await
        .unwrap();
    let snap = store.snapshot().await;
    assert_eq!(snap.upstream_session_id.as_deref(), Some("sfu-abc"));
    assert_eq!(snap.mic_track_name.as_deref(), Some("mic-1"));
    assert!(snap.allow_reconnect);
    let armed = *store.alarm_rx().borrow();
    assert_eq!(armed, snap.earliest_deadline());
    assert_eq!(armed, snap.keep_alive_deadline);

    store.destroy().await.unwrap();
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn test_alarm_task_drives_deadline_chain() {
    // A cleanup deadline fires, the handler replaces it with a second
    // deadline, and that fires too: the single-alarm multiplexing works
    // across handler-driven rescheduling.
    let store = Arc::new(
        StateStore::restore(StoreBackend::memory(), "chain")
            .await
            .unwrap(),
    );
    let fired = Arc::new(AtomicUsize::new(0));

    let handle = {
        let store = store.clone();
        let fired = fired.clone();
        spawn_alarm_task(store.alarm_rx(), "chain".into(), move || {
            let store = store.clone();
            let fired = fired.clone();
            async move {
                let n = fired.fetch_add(1, Ordering::SeqCst);
                let patch = if n == 0 {
                    StatePatch {
                        cleanup_deadline: Some(None),
                        inactivity_deadline: Some(Some(now_ms() + 50)),
                        ..Default::default()
                    }
                } else {
                    StatePatch {
                        inactivity_deadline: Some(None),
                        ..Default::default()
                    }
                };
                let _ = store.update(patch, false).await;
            }
        })
    };

    store
        .update(
            StatePatch {
                cleanup_deadline: Some(Some(now_ms() + 30)),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(*store.alarm_rx().borrow(), None);
    handle.abort();
}

// ---------------------------------------------------------------------------
// Wire framing
// ---------------------------------------------------------------------------

#[test]
fn test_packet_round_trip_across_sizes() {
    for len in [0usize, 2, 160, 3200, 16_000, 65_536] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let frame = packet::encode(len as u32, 42, &payload);
        let pkt = packet::decode(&frame).unwrap();
        assert_eq!(pkt.sequence, len as u32);
        assert_eq!(pkt.timestamp, 42);
        assert_eq!(pkt.payload.to_vec(), payload);
    }
}

// ---------------------------------------------------------------------------
// Send queue under load
// ---------------------------------------------------------------------------

#[test]
fn test_queue_stays_bounded_and_ordered_under_load() {
    let queue = SendQueue::new();
    // 10 MB of 4 KB packets against a 2 MiB cap.
    for i in 0..2560u32 {
        let mut buf = vec![0u8; 4096];
        buf[..4].copy_from_slice(&i.to_be_bytes());
        queue.enqueue(Bytes::from(buf));
        assert!(queue.queued_bytes() <= send_queue::MAX_QUEUE_BYTES);
    }
    // Whatever survived drains in strictly increasing packet order.
    let mut last_seen = None;
    while let Some(batch) = queue.pop_batch() {
        for chunk in batch.chunks_exact(4096) {
            let n = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if let Some(prev) = last_seen {
                assert!(n > prev, "packet {} after {}", n, prev);
            }
            last_seen = Some(n);
        }
    }
    // The newest packet is always retained.
    assert_eq!(last_seen, Some(2559));
}

// ---------------------------------------------------------------------------
// Live scenarios (require a running server and real credentials)
// ---------------------------------------------------------------------------

fn server_url() -> String {
    std::env::var("MEDIABRIDGE_TEST_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[tokio::test]
#[ignore]
async fn test_live_publish_unpublish_lifecycle() {
    let base = server_url();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/it-s2/publish", base))
        .json(&serde_json::json!({"speaker": "zeus"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{}/it-s2/unpublish", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // A second unpublish is a precondition failure.
    let resp = client
        .post(format!("{}/it-s2/unpublish", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .delete(format!("{}/it-s2", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
}

#[tokio::test]
#[ignore]
async fn test_live_generate_is_detached() {
    let base = server_url();
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/it-gen/generate", base))
        .json(&serde_json::json!({"text": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
}

fn uuid() -> String {
    format!("{:x}", now_ms())
}

//! WebSocket link to the streaming speech provider.
//!
//! The provider refuses credentials on the raw WebSocket handshake query, so
//! the upgrade request carries an `Authorization` bearer header. After the
//! open (bounded by a 10 s timeout) the stream is split: a writer task owns
//! the sink and consumes a bounded channel of outbound frames; a reader task
//! forwards inbound frames to the adapter as typed events. The adapter holds
//! only channel ends, never the socket, so there is no reference cycle.

use crate::error::{Error, Result};
use crate::state::StatePatch;
use crate::store::{now_ms, StateStore};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};

/// Hard cap on the WebSocket open handshake.
pub const OPEN_TIMEOUT_MS: u64 = 10_000;
/// Give up reconnecting after this many consecutive failures.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// First reconnect delay; doubles each attempt.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;
/// Backoff ceiling.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
/// A later reconnect deadline within this of an armed one is not written.
pub const RECONNECT_CHURN_GUARD_MS: u64 = 250;

/// Exponential backoff delay for the given attempt count.
pub fn reconnect_delay_ms(attempts: u32) -> u64 {
    (RECONNECT_BASE_DELAY_MS << attempts.min(10)).min(RECONNECT_MAX_DELAY_MS)
}

/// Frames the adapter pushes toward the provider.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Frames the provider pushes toward the adapter.
#[derive(Debug)]
pub enum UpstreamEvent {
    Text(String),
    Binary(Bytes),
    Closed,
}

/// Cloneable handle to an established upstream socket.
#[derive(Clone)]
pub struct UpstreamHandle {
    tx: mpsc::Sender<OutboundFrame>,
    open: Arc<AtomicBool>,
}

impl UpstreamHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        self.tx
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|_| Error::UpstreamUnavailable("upstream writer gone".into()))
    }

    pub async fn send_binary(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .send(OutboundFrame::Binary(bytes))
            .await
            .map_err(|_| Error::UpstreamUnavailable("upstream writer gone".into()))
    }

    /// Request a clean close; the writer task sends the close frame.
    pub async fn close(&self) {
        self.mark_closed();
        let _ = self.tx.send(OutboundFrame::Close).await;
    }

    /// Channel-backed handle with no socket behind it, for tests and for the
    /// connector plumbing. The returned receiver observes outbound frames.
    pub fn pipe(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

/// Open the provider WebSocket and spawn its writer/reader tasks. Inbound
/// frames arrive on the returned receiver; a final `Closed` event marks the
/// end of the connection.
pub async fn open_link(
    url: &str,
    token: &str,
    label: &str,
) -> Result<(UpstreamHandle, mpsc::Receiver<UpstreamEvent>)> {
    let request = tungstenite::http::Request::builder()
        .uri(url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", token))
        .body(())
        .map_err(|e| Error::UpstreamUnavailable(format!("bad upstream request: {}", e)))?;

    let connect = connect_async(request);
    let (stream, _response) =
        match tokio::time::timeout(Duration::from_millis(OPEN_TIMEOUT_MS), connect).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "upstream open exceeded {} ms",
                    OPEN_TIMEOUT_MS
                )))
            }
        };
    eprintln!("[Upstream {}] Connected", label);

    let (mut sink, mut source) = stream.split();
    let open = Arc::new(AtomicBool::new(true));
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);
    let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(256);

    // Writer: drains the outbound channel into the sink.
    let writer_open = open.clone();
    let writer_label = label.to_string();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutboundFrame::Text(t) => sink.send(tungstenite::Message::Text(t)).await,
                OutboundFrame::Binary(b) => {
                    sink.send(tungstenite::Message::Binary(b.to_vec())).await
                }
                OutboundFrame::Close => {
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                eprintln!("[Upstream {}] Send error: {}", writer_label, e);
                break;
            }
        }
        writer_open.store(false, Ordering::SeqCst);
    });

    // Reader: forwards inbound frames as typed events, ending with Closed.
    let reader_open = open.clone();
    let reader_label = label.to_string();
    tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(tungstenite::Message::Text(t)) => {
                    if event_tx.send(UpstreamEvent::Text(t)).await.is_err() {
                        break;
                    }
                }
                Ok(tungstenite::Message::Binary(b)) => {
                    if event_tx
                        .send(UpstreamEvent::Binary(Bytes::from(b)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    eprintln!(
                        "[Upstream {}] Closed by provider{}",
                        reader_label,
                        frame
                            .map(|f| format!(": {} {}", f.code, f.reason))
                            .unwrap_or_default()
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[Upstream {}] Receive error: {}", reader_label, e);
                    break;
                }
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        let _ = event_tx.send(UpstreamEvent::Closed).await;
    });

    Ok((UpstreamHandle { tx: out_tx, open }, event_rx))
}

/// Record a failed (or closed) upstream and arm the backoff deadline. A
/// deadline is only written when no earlier one is armed; attempts past the
/// cap stop the cycle.
pub async fn schedule_reconnect(store: &StateStore, label: &str) -> Result<()> {
    let snap = store.snapshot().await;
    if !snap.allow_reconnect {
        return Ok(());
    }
    if snap.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
        eprintln!(
            "[Upstream {}] Giving up after {} reconnect attempts",
            label, snap.reconnect_attempts
        );
        store
            .update(
                StatePatch {
                    allow_reconnect: Some(false),
                    reconnect_deadline: Some(None),
                    ..Default::default()
                },
                false,
            )
            .await?;
        return Ok(());
    }
    let delay = reconnect_delay_ms(snap.reconnect_attempts);
    let deadline = now_ms() + delay;
    let mut patch = StatePatch {
        reconnect_attempts: Some(snap.reconnect_attempts + 1),
        ..Default::default()
    };
    match snap.reconnect_deadline {
        Some(current) if deadline + RECONNECT_CHURN_GUARD_MS >= current => {}
        _ => patch.reconnect_deadline = Some(Some(deadline)),
    }
    eprintln!(
        "[Upstream {}] Reconnecting in {}ms (attempt {}/{})",
        label,
        delay,
        snap.reconnect_attempts + 1,
        MAX_RECONNECT_ATTEMPTS
    );
    store.update(patch, false).await?;
    Ok(())
}

/// Clear the backoff bookkeeping after a successful open.
pub async fn clear_reconnect(store: &StateStore) -> Result<()> {
    store
        .update(
            StatePatch {
                reconnect_attempts: Some(0),
                reconnect_deadline: Some(None),
                ..Default::default()
            },
            false,
        )
        .await?;
    Ok(())
}

// ── typed provider messages ──

/// Control messages on the TTS socket.
#[derive(Debug, PartialEq)]
pub enum TtsControl {
    /// All buffered text has been synthesized; the stream is complete.
    Flushed,
    /// Metadata, warnings, acks: logged and ignored.
    Other,
}

impl TtsControl {
    /// Malformed JSON yields `None`; the caller logs and drops it.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("Flushed") => Some(TtsControl::Flushed),
            _ => Some(TtsControl::Other),
        }
    }
}

/// A transcript message on the STT socket.
#[derive(Debug)]
pub struct SttTranscript {
    pub value: serde_json::Value,
    /// Set when the provider flushed this transcript in response to a
    /// Finalize.
    pub from_finalize: bool,
}

impl SttTranscript {
    /// Malformed JSON yields `None`. A `created` field is provider
    /// bookkeeping and never treated as a completion signal.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let from_finalize = value
            .get("from_finalize")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Some(Self {
            value,
            from_finalize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        assert_eq!(reconnect_delay_ms(0), 1000);
        assert_eq!(reconnect_delay_ms(1), 2000);
        assert_eq!(reconnect_delay_ms(2), 4000);
        assert_eq!(reconnect_delay_ms(4), 16_000);
        assert_eq!(reconnect_delay_ms(5), 30_000);
        assert_eq!(reconnect_delay_ms(30), 30_000);
    }

    #[test]
    fn test_tts_control_parse() {
        assert_eq!(
            TtsControl::parse(r#"{"type":"Flushed"}"#),
            Some(TtsControl::Flushed)
        );
        assert_eq!(
            TtsControl::parse(r#"{"type":"Metadata","x":1}"#),
            Some(TtsControl::Other)
        );
        assert_eq!(TtsControl::parse("not json"), None);
    }

    #[test]
    fn test_stt_transcript_parse() {
        let t = SttTranscript::parse(r#"{"channel":{"alternatives":[]},"from_finalize":true}"#)
            .unwrap();
        assert!(t.from_finalize);
        let t = SttTranscript::parse(r#"{"created":"2024-01-01","text":"hi"}"#).unwrap();
        assert!(!t.from_finalize);
        assert!(SttTranscript::parse("{{").is_none());
    }

    #[tokio::test]
    async fn test_pipe_handle_send_and_close() {
        let (handle, mut rx) = UpstreamHandle::pipe(8);
        assert!(handle.is_open());
        handle.send_text("hello".into()).await.unwrap();
        handle.send_binary(Bytes::from_static(&[1, 2])).await.unwrap();
        handle.close().await;
        assert!(!handle.is_open());
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Text(t)) if t == "hello"));
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Binary(_))));
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Close)));
    }

    #[tokio::test]
    async fn test_schedule_reconnect_respects_cap_and_guard() {
        let store = StateStore::restore(crate::store::StoreBackend::memory(), "t")
            .await
            .unwrap();
        store
            .update(
                StatePatch {
                    allow_reconnect: Some(true),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        schedule_reconnect(&store, "t").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.reconnect_attempts, 1);
        let first_deadline = snap.reconnect_deadline.unwrap();

        // Second failure: a later deadline must not overwrite the armed,
        // earlier one.
        schedule_reconnect(&store, "t").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.reconnect_deadline, Some(first_deadline));

        // Exhaust the allowed attempts.
        for _ in 0..5 {
            schedule_reconnect(&store, "t").await.unwrap();
        }
        assert_eq!(store.snapshot().await.reconnect_attempts, MAX_RECONNECT_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_schedule_reconnect_noop_when_disallowed() {
        let store = StateStore::restore(crate::store::StoreBackend::memory(), "t")
            .await
            .unwrap();
        schedule_reconnect(&store, "t").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.reconnect_deadline.is_none());
    }
}

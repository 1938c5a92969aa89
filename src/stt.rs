//! STT session adapter: microphone track in, transcripts out.
//!
//! Publishes the browser microphone into the SFU, pulls it back as PCM over
//! a WebSocket adapter, transcodes to 16 kHz mono, and streams it to the
//! provider through the bounded send queue. Transcripts fan out to
//! subscribed clients, with the last hundred replayed to late joiners.
//! Between `connect` and `start-forwarding` the provider socket is kept warm
//! with KeepAlive heartbeats.

use crate::config::BridgeConfig;
use crate::connector::DedupedConnector;
use crate::error::{Error, Result};
use crate::packet;
use crate::registry::{ClientFrame, ClientRegistry, ClientRole};
use crate::send_queue::{SendQueue, MAX_BATCHES_PER_TURN, MAX_SLICE_MS, MIN_BATCH_BYTES};
use crate::sfu::SfuClient;
use crate::state::StatePatch;
use crate::store::{now_ms, spawn_alarm_task, StateStore, StoreBackend, DEFAULT_INACTIVITY_TIMEOUT_MS};
use crate::transcode::{stereo_to_mono, AudioTranscoder};
use crate::upstream::{
    clear_reconnect, open_link, schedule_reconnect, SttTranscript, UpstreamEvent, UpstreamHandle,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Heartbeat interval while warm but not forwarding.
pub const KEEPALIVE_INTERVAL_MS: u64 = 5000;
/// Transcripts replayed to a late-joining client.
pub const TRANSCRIPT_RING_CAPACITY: usize = 100;
/// Idle window granted after a debug upstream restart with nobody attached.
pub const DEBUG_NO_CLIENT_GRACE_MS: u64 = 30_000;

pub struct SttAdapter {
    session_name: String,
    config: BridgeConfig,
    sfu: Arc<SfuClient>,
    store: StateStore,
    registry: ClientRegistry,
    connector: DedupedConnector,
    queue: SendQueue,
    transcoder: Mutex<AudioTranscoder>,
    ring: StdMutex<VecDeque<String>>,
    alarm_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SttAdapter {
    pub async fn create(
        session_name: &str,
        config: BridgeConfig,
        sfu: Arc<SfuClient>,
        backend: StoreBackend,
    ) -> Result<Arc<Self>> {
        let store = StateStore::restore(backend, session_name).await?;
        store
            .update(
                StatePatch {
                    session_name: Some(session_name.to_string()),
                    ..Default::default()
                },
                true,
            )
            .await?;
        let adapter = Arc::new(Self {
            session_name: session_name.to_string(),
            config,
            sfu,
            store,
            registry: ClientRegistry::new(),
            connector: DedupedConnector::new(),
            queue: SendQueue::new(),
            transcoder: Mutex::new(AudioTranscoder::downsampler_48k_to_16k()),
            ring: StdMutex::new(VecDeque::with_capacity(TRANSCRIPT_RING_CAPACITY)),
            alarm_task: StdMutex::new(None),
        });
        let task = {
            let this = adapter.clone();
            spawn_alarm_task(
                adapter.store.alarm_rx(),
                format!("stt-{}", session_name),
                move || {
                    let this = this.clone();
                    async move { this.alarm().await }
                },
            )
        };
        *adapter.alarm_task.lock().unwrap() = Some(task);
        Ok(adapter)
    }

    fn label(&self) -> String {
        format!("stt-{}", self.session_name)
    }

    fn log(&self, msg: &str) {
        eprintln!("[Stt {}] {}", self.session_name, msg);
    }

    // ── endpoints ──

    /// Publish the microphone into the SFU via auto-discovery and pre-warm
    /// the provider socket.
    pub async fn connect(self: Arc<Self>, session_description: &Value) -> Result<Value> {
        let discovered = self
            .sfu
            .add_tracks_auto_discover(session_description, "audio")
            .await?;
        let mic = discovered
            .track_names
            .first()
            .cloned()
            .ok_or_else(|| Error::BadPayload("no audio track in offer".into()))?;
        self.log(&format!(
            "Mic published into SFU session {} as {}",
            discovered.session_id, mic
        ));

        let callback = self.config.stt_subscribe_endpoint(&self.session_name);
        self.store
            .update(
                StatePatch {
                    upstream_session_id: Some(Some(discovered.session_id.clone())),
                    mic_track_name: Some(Some(mic)),
                    sfu_callback_url: Some(Some(callback)),
                    allow_reconnect: Some(false),
                    keep_alive_deadline: Some(Some(now_ms() + KEEPALIVE_INTERVAL_MS)),
                    ..Default::default()
                },
                false,
            )
            .await?;

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.clone().ensure_upstream().await {
                this.log(&format!("Upstream pre-warm failed (non-fatal): {}", e));
            }
        });

        if self.registry.total_open() == 0 {
            self.store
                .schedule_inactivity(now_ms() + DEFAULT_INACTIVITY_TIMEOUT_MS)
                .await?;
        }
        Ok(discovered.answer)
    }

    /// Bind the mic track to our sfu-subscribe endpoint. Idempotent when
    /// forwarding is already active.
    pub async fn start_forwarding(&self) -> Result<Value> {
        let snap = self.store.snapshot().await;
        let session_id = snap
            .upstream_session_id
            .ok_or_else(|| Error::Precondition("connect not called".into()))?;
        if let Some(adapter_id) = snap.upstream_adapter_id {
            self.log("Forwarding already active");
            return Ok(json!({ "adapterId": adapter_id, "alreadyActive": true }));
        }
        let mic = snap
            .mic_track_name
            .ok_or_else(|| Error::Precondition("connect not called".into()))?;
        let endpoint = snap
            .sfu_callback_url
            .unwrap_or_else(|| self.config.stt_subscribe_endpoint(&self.session_name));

        let adapter = self
            .sfu
            .pull_track_to_websocket(&session_id, &mic, &endpoint, "pcm")
            .await?;
        self.log(&format!("Forwarding started (adapter {})", adapter.adapter_id));

        self.store
            .update(
                StatePatch {
                    upstream_adapter_id: Some(Some(adapter.adapter_id.clone())),
                    keep_alive_deadline: Some(None),
                    inactivity_deadline: Some(None),
                    allow_reconnect: Some(true),
                    ..Default::default()
                },
                false,
            )
            .await?;
        Ok(adapter.json)
    }

    /// Unbind the mic track, flush buffered audio through a Finalize, and
    /// fall back to the warm pre-forwarding state. Idempotent.
    pub async fn stop_forwarding(self: Arc<Self>) -> Result<()> {
        let snap = self.store.snapshot().await;
        if let Some(adapter_id) = &snap.upstream_adapter_id {
            self.sfu.close_websocket_adapter(adapter_id).await?;
        }
        self.store
            .update(
                StatePatch {
                    upstream_adapter_id: Some(None),
                    pending_finalize: Some(true),
                    allow_reconnect: Some(false),
                    keep_alive_deadline: Some(Some(now_ms() + KEEPALIVE_INTERVAL_MS)),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.clone().spawn_drain();

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.clone().ensure_upstream().await {
                this.log(&format!("Upstream re-warm failed (non-fatal): {}", e));
            }
        });

        if self.registry.total_open() == 0 {
            self.store
                .schedule_inactivity(now_ms() + DEFAULT_INACTIVITY_TIMEOUT_MS)
                .await?;
        }
        self.log("Forwarding stopped");
        Ok(())
    }

    /// Debug restart of the provider socket without finalizing.
    pub async fn reconnect_upstream(self: Arc<Self>) -> Result<&'static str> {
        if self.registry.total_open() == 0 {
            // Leave a short window for a client to attach before the session
            // winds down.
            self.store
                .schedule_inactivity(now_ms() + DEBUG_NO_CLIENT_GRACE_MS)
                .await?;
            return Ok("No clients connected");
        }
        if let Some(handle) = self.connector.take().await {
            handle.close().await;
        }
        self.clone().ensure_upstream().await?;
        self.log("Upstream restarted");
        Ok("Reconnected")
    }

    /// Accept the SFU-side audio socket (single subscriber).
    pub fn accept_sfu_audio(&self) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        self.registry.accept(ClientRole::SfuAudio)
    }

    /// Accept a transcription client; replay the ring, cancel inactivity.
    pub async fn accept_transcription_stream(&self) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        let (id, rx) = self.registry.accept(ClientRole::TranscriptionStream);
        let backlog: Vec<String> = self.ring.lock().unwrap().iter().cloned().collect();
        for entry in backlog {
            self.registry.send_to(id, ClientFrame::Text(entry));
        }
        if let Err(e) = self
            .store
            .update(
                StatePatch {
                    inactivity_deadline: Some(None),
                    ..Default::default()
                },
                false,
            )
            .await
        {
            self.log(&format!("Inactivity cancel failed: {}", e));
        }
        (id, rx)
    }

    /// Binary frame from the SFU audio socket: decode, transcode to 16 kHz
    /// mono, enqueue, nudge the drain.
    pub async fn on_sfu_frame(self: Arc<Self>, frame: &[u8]) {
        let pkt = match packet::decode(frame) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.log(&format!("Dropping malformed SFU frame: {}", e));
                return;
            }
        };
        if pkt.payload.is_empty() {
            return;
        }
        let mono48 = stereo_to_mono(&pkt.payload);
        let mono16 = self.transcoder.lock().await.process(&mono48);
        if !mono16.is_empty() {
            self.queue.enqueue(Bytes::from(mono16));
            self.clone().spawn_drain();
        }
    }

    pub async fn on_client_disconnect(&self, id: Uuid) {
        self.registry.remove(id);
        if let Err(e) = self.store.schedule_cleanup().await {
            self.log(&format!("Cleanup scheduling failed: {}", e));
        }
    }

    pub fn client_count(&self) -> usize {
        self.registry.total_open()
    }

    /// Hard teardown.
    pub async fn destroy(&self) -> Result<()> {
        if let Some(task) = self.alarm_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(handle) = self.connector.take().await {
            handle.close().await;
        }
        self.registry.close_all(1000, "Session destroyed");
        self.queue.clear();
        self.ring.lock().unwrap().clear();
        self.store.update(StatePatch::wipe(), true).await?;
        self.store.destroy().await?;
        self.log("Destroyed");
        Ok(())
    }

    // ── upstream plumbing ──

    async fn ensure_upstream(self: Arc<Self>) -> Result<UpstreamHandle> {
        let this = self.clone();
        self.connector
            .connect(|| async move {
                let url = this.config.stt_ws_url();
                let (handle, events) =
                    open_link(&url, &this.config.speech_api_token, &this.label()).await?;
                clear_reconnect(&this.store).await?;
                this.clone().spawn_event_pump(events);
                this.clone().spawn_drain();
                Ok(handle)
            })
            .await
    }

    fn spawn_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<UpstreamEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    UpstreamEvent::Text(text) => self.on_upstream_text(&text),
                    UpstreamEvent::Binary(_) => {}
                    UpstreamEvent::Closed => {
                        self.on_upstream_closed().await;
                        break;
                    }
                }
            }
        });
    }

    /// Transcript broadcast: wrap, retain in the ring, fan out. A finalize
    /// flush additionally emits `segment_finalized`.
    fn on_upstream_text(&self, text: &str) {
        let transcript = match SttTranscript::parse(text) {
            Some(t) => t,
            None => {
                self.log(&format!("Ignoring malformed upstream message: {}", text));
                return;
            }
        };
        let emitted = json!({
            "type": "transcription",
            "data": transcript.value,
            "timestamp": now_ms(),
        })
        .to_string();
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == TRANSCRIPT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(emitted.clone());
        }
        self.registry
            .fan_out(ClientRole::TranscriptionStream, ClientFrame::Text(emitted));
        if transcript.from_finalize {
            let event = json!({
                "type": "segment_finalized",
                "timestamp": now_ms(),
            })
            .to_string();
            self.registry
                .fan_out(ClientRole::TranscriptionStream, ClientFrame::Text(event));
        }
    }

    async fn on_upstream_closed(&self) {
        self.log("Upstream closed");
        let snap = self.store.snapshot().await;
        if snap.closing_due_to_inactivity {
            self.finish_inactive_close().await;
            return;
        }
        if snap.allow_reconnect {
            if let Err(e) = schedule_reconnect(&self.store, &self.label()).await {
                self.log(&format!("Reconnect scheduling failed: {}", e));
            }
        }
    }

    /// The inactivity CloseStream completed. Occupancy is re-checked: a
    /// client that arrived while the close was in flight keeps its socket.
    async fn finish_inactive_close(&self) {
        let patch = StatePatch {
            closing_due_to_inactivity: Some(false),
            pending_close: Some(false),
            allow_reconnect: Some(false),
            ..Default::default()
        };
        if self.registry.total_open() == 0 {
            let done = json!({"type": "stt_done", "timestamp": now_ms()}).to_string();
            self.registry
                .fan_out(ClientRole::TranscriptionStream, ClientFrame::Text(done));
            self.registry
                .close_role(ClientRole::TranscriptionStream, 1000, "Transcription complete");
            self.log("Transcription complete");
        } else {
            self.log("Clients reappeared during close, keeping sockets");
        }
        if let Err(e) = self.store.update(patch, false).await {
            self.log(&format!("Close bookkeeping failed: {}", e));
        }
    }

    // ── drain loop ──

    pub fn spawn_drain(self: Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.drain().await });
    }

    /// Cooperative drain: coalesce queued audio into batches, ship in order,
    /// then emit the pending control message once empty. Yields to the
    /// scheduler every `MAX_BATCHES_PER_TURN` batches or `MAX_SLICE_MS`.
    async fn drain(self: Arc<Self>) {
        if !self.queue.try_begin_drain() {
            return;
        }
        let turn_start = Instant::now();
        let mut batches = 0usize;

        loop {
            let snap = self.store.snapshot().await;
            let flush = snap.pending_finalize || snap.pending_close;
            let queued = self.queue.queued_bytes();
            if !(queued >= MIN_BATCH_BYTES || (queued > 0 && flush)) {
                break;
            }
            let handle = match self.clone().ensure_upstream().await {
                Ok(h) if h.is_open() => h,
                _ => {
                    self.queue.end_drain();
                    return;
                }
            };
            let Some(batch) = self.queue.pop_batch() else {
                break;
            };
            if handle.send_binary(batch).await.is_err() {
                self.queue.end_drain();
                return;
            }
            batches += 1;
            if batches >= MAX_BATCHES_PER_TURN
                || turn_start.elapsed().as_millis() as u64 >= MAX_SLICE_MS
            {
                self.queue.end_drain();
                self.clone().spawn_drain();
                return;
            }
        }

        if self.queue.is_empty() {
            if let Some(handle) = self.connector.current().await {
                let snap = self.store.snapshot().await;
                if snap.pending_finalize {
                    if handle
                        .send_text(json!({"type": "Finalize"}).to_string())
                        .await
                        .is_ok()
                    {
                        self.log("Finalize sent");
                        let _ = self
                            .store
                            .update(
                                StatePatch {
                                    pending_finalize: Some(false),
                                    ..Default::default()
                                },
                                false,
                            )
                            .await;
                    }
                } else if snap.pending_close {
                    if handle
                        .send_text(json!({"type": "CloseStream"}).to_string())
                        .await
                        .is_ok()
                    {
                        self.log("CloseStream sent");
                        let _ = self
                            .store
                            .update(
                                StatePatch {
                                    pending_close: Some(false),
                                    ..Default::default()
                                },
                                false,
                            )
                            .await;
                    }
                }
            }
        }

        self.queue.end_drain();

        // Work that arrived while we were finishing gets its own turn.
        let snap = self.store.snapshot().await;
        let flush = snap.pending_finalize || snap.pending_close;
        let queued = self.queue.queued_bytes();
        if queued >= MIN_BATCH_BYTES || (queued > 0 && flush) {
            self.clone().spawn_drain();
        }
    }

    // ── alarm reducer ──

    /// Deadline handler: cleanup, keepalive, inactivity, reconnect, one
    /// merged write.
    pub async fn alarm(self: Arc<Self>) {
        let now = now_ms();
        let snap = self.store.snapshot().await;
        let mut patch = StatePatch::default();

        if snap.cleanup_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.cleanup_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Last client gone");
                patch.inactivity_deadline = Some(Some(now + DEFAULT_INACTIVITY_TIMEOUT_MS));
            }
        }

        if snap.keep_alive_deadline.map(|d| d <= now).unwrap_or(false) {
            let pre_forwarding =
                snap.upstream_session_id.is_some() && snap.upstream_adapter_id.is_none();
            let handle = self.connector.current().await;
            match handle {
                Some(h) if h.is_open() && pre_forwarding => {
                    if h.send_text(json!({"type": "KeepAlive"}).to_string())
                        .await
                        .is_ok()
                    {
                        patch.keep_alive_deadline = Some(Some(now + KEEPALIVE_INTERVAL_MS));
                    } else {
                        patch.keep_alive_deadline = Some(None);
                    }
                }
                _ => {
                    patch.keep_alive_deadline = Some(None);
                }
            }
        }

        if snap.inactivity_deadline.map(|d| d <= now).unwrap_or(false)
            && patch.inactivity_deadline.is_none()
        {
            patch.inactivity_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Inactive, requesting end-of-stream");
                patch.pending_close = Some(true);
                patch.closing_due_to_inactivity = Some(true);
            }
        }

        let mut attempt_reconnect = false;
        if snap.reconnect_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.reconnect_deadline = Some(None);
            attempt_reconnect = snap.allow_reconnect;
        }

        let closing = patch.closing_due_to_inactivity == Some(true);
        if !patch.is_empty() {
            if let Err(e) = self.store.update(patch, false).await {
                self.log(&format!("Alarm write failed: {}", e));
            }
        }

        if closing {
            // Drive the close through the drain so it follows queued audio.
            // With no socket to close, finish directly.
            match self.connector.current().await {
                Some(h) if h.is_open() => self.clone().spawn_drain(),
                _ => self.finish_inactive_close().await,
            }
        }

        if attempt_reconnect {
            match self.clone().ensure_upstream().await {
                Ok(_) => self.log("Upstream reconnected"),
                Err(e) => {
                    self.log(&format!("Reconnect attempt failed: {}", e));
                    let _ = schedule_reconnect(&self.store, &self.label()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::OutboundFrame;
    use std::path::PathBuf;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            sfu_api_base: "http://sfu.invalid/v1".into(),
            sfu_app_id: "app".into(),
            sfu_app_token: "tok".into(),
            speech_api_host: "speech.invalid".into(),
            speech_api_token: "tok".into(),
            tts_model: "aura-2".into(),
            stt_model: "nova-3".into(),
            public_base_url: "http://bridge.invalid".into(),
            state_dir: PathBuf::from("/tmp/unused"),
        }
    }

    async fn test_adapter(name: &str) -> Arc<SttAdapter> {
        let config = test_config();
        let sfu = Arc::new(SfuClient::new(&config));
        let adapter = SttAdapter::create(name, config, sfu, StoreBackend::memory())
            .await
            .unwrap();
        *adapter.transcoder.lock().await = AudioTranscoder::scalar(48_000, 16_000);
        adapter
    }

    /// Seed the connector with a channel-backed upstream and return the
    /// frame receiver.
    async fn seed_upstream(adapter: &Arc<SttAdapter>) -> mpsc::Receiver<OutboundFrame> {
        let (handle, rx) = UpstreamHandle::pipe(256);
        adapter
            .connector
            .connect(|| async move { Ok(handle) })
            .await
            .unwrap();
        rx
    }

    fn stereo_48k_frame(samples: &[i16]) -> Vec<u8> {
        let mut pcm = Vec::new();
        for s in samples {
            pcm.extend_from_slice(&s.to_le_bytes()); // L
            pcm.extend_from_slice(&s.to_le_bytes()); // R
        }
        packet::encode(1, 0, &pcm).to_vec()
    }

    #[tokio::test]
    async fn test_sfu_frame_transcodes_and_enqueues() {
        let adapter = test_adapter("s1").await;
        // Six 48 kHz frames decimate 3:1 to two 16 kHz samples.
        let frame = stereo_48k_frame(&[10, 20, 30, 40, 50, 60]);
        adapter.clone().on_sfu_frame(&frame).await;
        assert_eq!(adapter.queue.queued_bytes(), 4);
        let batch = adapter.queue.pop_batch().unwrap();
        let samples: Vec<i16> = batch
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![10, 40]);
    }

    #[tokio::test]
    async fn test_drain_ships_audio_then_finalize() {
        let adapter = test_adapter("s2").await;
        let mut rx = seed_upstream(&adapter).await;

        let first = Bytes::from(vec![1u8; 2000]);
        let second = Bytes::from(vec![2u8; 2000]);
        adapter.queue.enqueue(first.clone());
        adapter.queue.enqueue(second.clone());
        adapter
            .store
            .update(
                StatePatch {
                    pending_finalize: Some(true),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();

        adapter.clone().drain().await;

        // All audio in order, then exactly one Finalize.
        let mut audio = Vec::new();
        let mut controls = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                OutboundFrame::Binary(b) => audio.extend_from_slice(&b),
                OutboundFrame::Text(t) => controls.push(t),
                OutboundFrame::Close => {}
            }
        }
        let mut expected = first.to_vec();
        expected.extend_from_slice(&second);
        assert_eq!(audio, expected);
        assert_eq!(controls, vec![r#"{"type":"Finalize"}"#.to_string()]);
        assert!(!adapter.store.snapshot().await.pending_finalize);
        assert!(adapter.queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_close_stream_after_audio() {
        let adapter = test_adapter("s3").await;
        let mut rx = seed_upstream(&adapter).await;
        adapter.queue.enqueue(Bytes::from(vec![7u8; 100]));
        adapter
            .store
            .update(
                StatePatch {
                    pending_close: Some(true),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        adapter.clone().drain().await;

        let mut saw_audio_before_close = false;
        let mut close_stream_seen = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                OutboundFrame::Binary(_) => {
                    assert!(!close_stream_seen, "audio after CloseStream");
                    saw_audio_before_close = true;
                }
                OutboundFrame::Text(t) if t.contains("CloseStream") => {
                    close_stream_seen = true;
                }
                _ => {}
            }
        }
        assert!(saw_audio_before_close);
        assert!(close_stream_seen);
        assert!(!adapter.store.snapshot().await.pending_close);
    }

    #[tokio::test]
    async fn test_small_audio_waits_for_min_batch() {
        let adapter = test_adapter("s4").await;
        let _rx = seed_upstream(&adapter).await;
        adapter.queue.enqueue(Bytes::from(vec![1u8; 100]));
        adapter.clone().drain().await;
        // Under MIN_BATCH_BYTES with no flush flag: nothing leaves.
        assert_eq!(adapter.queue.queued_bytes(), 100);
    }

    #[tokio::test]
    async fn test_transcript_ring_replayed_to_late_joiner() {
        let adapter = test_adapter("s5").await;
        adapter.on_upstream_text(r#"{"text":"one"}"#);
        adapter.on_upstream_text(r#"{"text":"two"}"#);

        let (_id, mut rx) = adapter.accept_transcription_stream().await;
        let mut texts = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ClientFrame::Text(t) = frame {
                texts.push(t);
            }
        }
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("one"));
        assert!(texts[1].contains("two"));
    }

    #[tokio::test]
    async fn test_ring_capped_at_capacity() {
        let adapter = test_adapter("s6").await;
        for i in 0..(TRANSCRIPT_RING_CAPACITY + 10) {
            adapter.on_upstream_text(&format!(r#"{{"n":{}}}"#, i));
        }
        assert_eq!(adapter.ring.lock().unwrap().len(), TRANSCRIPT_RING_CAPACITY);
    }

    #[tokio::test]
    async fn test_from_finalize_emits_segment_finalized() {
        let adapter = test_adapter("s7").await;
        let (_id, mut rx) = adapter.accept_transcription_stream().await;
        adapter.on_upstream_text(r#"{"text":"done","from_finalize":true}"#);
        let mut texts = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let ClientFrame::Text(t) = frame {
                texts.push(t);
            }
        }
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("transcription"));
        assert!(texts[1].contains("segment_finalized"));
    }

    #[tokio::test]
    async fn test_malformed_upstream_message_ignored() {
        let adapter = test_adapter("s8").await;
        let (_id, mut rx) = adapter.accept_transcription_stream().await;
        adapter.on_upstream_text("not json at all");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keepalive_fires_only_pre_forwarding() {
        let adapter = test_adapter("s9").await;
        let mut rx = seed_upstream(&adapter).await;
        adapter
            .store
            .update(
                StatePatch {
                    upstream_session_id: Some(Some("sfu-1".into())),
                    keep_alive_deadline: Some(Some(now_ms() - 1)),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        adapter.clone().alarm().await;
        assert!(matches!(
            rx.try_recv(),
            Ok(OutboundFrame::Text(t)) if t.contains("KeepAlive")
        ));
        // Deadline re-armed roughly one interval out.
        let snap = adapter.store.snapshot().await;
        assert!(snap.keep_alive_deadline.unwrap() > now_ms());

        // Forwarding active: the next expiry clears instead of sending.
        adapter
            .store
            .update(
                StatePatch {
                    upstream_adapter_id: Some(Some("ad-1".into())),
                    keep_alive_deadline: Some(Some(now_ms() - 1)),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        adapter.clone().alarm().await;
        assert!(rx.try_recv().is_err());
        assert!(adapter.store.snapshot().await.keep_alive_deadline.is_none());
    }

    #[tokio::test]
    async fn test_inactivity_drives_close_and_stt_done() {
        let adapter = test_adapter("s10").await;
        // No upstream socket: the close completes directly.
        let (id, rx) = adapter.accept_transcription_stream().await;
        drop(rx); // client goes away
        adapter.registry.remove(id);
        adapter
            .store
            .update(
                StatePatch {
                    inactivity_deadline: Some(Some(now_ms() - 1)),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        adapter.clone().alarm().await;
        let snap = adapter.store.snapshot().await;
        assert!(!snap.closing_due_to_inactivity);
        assert!(!snap.pending_close);
        assert!(!snap.allow_reconnect);
    }

    #[tokio::test]
    async fn test_occupancy_recovery_skips_client_disconnect() {
        let adapter = test_adapter("s11").await;
        adapter
            .store
            .update(
                StatePatch {
                    closing_due_to_inactivity: Some(true),
                    pending_close: Some(true),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        // A client arrives before the upstream close drains.
        let (_id, mut rx) = adapter.accept_transcription_stream().await;
        adapter.finish_inactive_close().await;
        // Socket stays open: no stt_done, no close frame.
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.client_count(), 1);
        assert!(!adapter.store.snapshot().await.closing_due_to_inactivity);
    }

    #[tokio::test]
    async fn test_start_forwarding_requires_connect() {
        let adapter = test_adapter("s12").await;
        match adapter.start_forwarding().await {
            Err(Error::Precondition(msg)) => assert!(msg.contains("connect")),
            other => panic!("expected precondition error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reconnect_upstream_with_no_clients() {
        let adapter = test_adapter("s13").await;
        let msg = adapter.clone().reconnect_upstream().await.unwrap();
        assert_eq!(msg, "No clients connected");
        // A short grace window is armed instead of a full idle timeout.
        let snap = adapter.store.snapshot().await;
        let deadline = snap.inactivity_deadline.unwrap();
        assert!(deadline <= now_ms() + DEBUG_NO_CLIENT_GRACE_MS);
    }
}

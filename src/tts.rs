//! TTS session adapter: text in, synthesized audio track out.
//!
//! Publishes a WebSocket-fed track into the SFU, streams synthesized PCM
//! from the speech provider through the transcoder (24 kHz mono -> 48 kHz
//! stereo), and fans encoded packets out to the SFU-side subscriber socket.
//! The finalized buffer of the most recent run is retained for late-joining
//! subscribers.

use crate::config::BridgeConfig;
use crate::connector::DedupedConnector;
use crate::error::{Error, Result};
use crate::packet;
use crate::registry::{ClientFrame, ClientRegistry, ClientRole};
use crate::sfu::SfuClient;
use crate::state::StatePatch;
use crate::store::{now_ms, spawn_alarm_task, StateStore, StoreBackend, DEFAULT_INACTIVITY_TIMEOUT_MS};
use crate::transcode::{mono_to_stereo, AudioTranscoder};
use crate::upstream::{
    clear_reconnect, open_link, schedule_reconnect, TtsControl, UpstreamEvent, UpstreamHandle,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Media payload per encoded packet.
const MEDIA_CHUNK_BYTES: usize = 16 * 1024;

/// Voice used when a generate arrives before any publish selected one.
const DEFAULT_VOICE: &str = "asteria";

pub struct TtsAdapter {
    session_name: String,
    config: BridgeConfig,
    sfu: Arc<SfuClient>,
    store: StateStore,
    registry: ClientRegistry,
    connector: DedupedConnector,
    http: reqwest::Client,
    transcoder: Mutex<AudioTranscoder>,
    /// Stereo 48 kHz output accumulated for the current synthesis run.
    run: Mutex<Vec<u8>>,
    last_buffer: StdMutex<Option<Bytes>>,
    sequence: AtomicU32,
    alarm_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TtsAdapter {
    /// Restore state and spawn the alarm task. The caller publishes the
    /// returned adapter only after this resolves, so handlers never observe
    /// pre-restore state.
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
            http: reqwest::Client::new(),
            transcoder: Mutex::new(AudioTranscoder::upsampler_24k_to_48k()),
            run: Mutex::new(Vec::new()),
            last_buffer: StdMutex::new(None),
            sequence: AtomicU32::new(0),
            alarm_task: StdMutex::new(None),
        });
        let task = {
            let this = adapter.clone();
            spawn_alarm_task(
                adapter.store.alarm_rx(),
                format!("tts-{}", session_name),
                move || {
                    let this = this.clone();
                    async move { this.alarm().await }
                },
            )
        };
        *adapter.alarm_task.lock().unwrap() = Some(task);
        Ok(adapter)
    }

    fn track_name(&self) -> String {
        format!("tts-{}", self.session_name)
    }

    fn log(&self, msg: &str) {
        eprintln!("[Tts {}] {}", self.session_name, msg);
    }

    // ── endpoints ──

    /// Publish the synthesized track into the SFU. 409 when already
    /// published; a failed upstream pre-open is non-fatal.
    pub async fn publish(self: Arc<Self>, speaker: String) -> Result<Value> {
        let snap = self.store.snapshot().await;
        if snap.upstream_adapter_id.is_some() {
            return Err(Error::Conflict("already published".into()));
        }

        self.store
            .update(
                StatePatch {
                    allow_reconnect: Some(true),
                    selected_voice: Some(Some(speaker)),
                    ..Default::default()
                },
                false,
            )
            .await?;

        let endpoint = self.config.tts_subscribe_endpoint(&self.session_name);
        let adapter = self
            .sfu
            .push_track_from_websocket(&self.track_name(), &endpoint)
            .await?;
        self.log(&format!(
            "Published track {} (adapter {})",
            self.track_name(),
            adapter.adapter_id
        ));

        self.store
            .update(
                StatePatch {
                    upstream_session_id: Some(adapter.session_id.clone()),
                    upstream_adapter_id: Some(Some(adapter.adapter_id.clone())),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.store
            .schedule_inactivity(now_ms() + DEFAULT_INACTIVITY_TIMEOUT_MS)
            .await?;

        // Pre-open the provider socket so the first generate is warm.
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.clone().ensure_upstream().await {
                this.log(&format!("Upstream pre-open failed (non-fatal): {}", e));
            }
        });

        Ok(adapter.json)
    }

    /// Proxy a player's offer into a new SFU session pulling our track.
    pub async fn connect_player(&self, session_description: &Value) -> Result<Value> {
        let snap = self.store.snapshot().await;
        let publisher = snap
            .upstream_session_id
            .ok_or_else(|| Error::Precondition("not published".into()))?;
        let player = self.sfu.create_session().await?;
        self.sfu
            .pull_remote_track_to_player(&player, &publisher, &self.track_name(), session_description)
            .await
    }

    /// Accept the SFU-side subscriber socket. A late joiner immediately
    /// receives the retained buffer in chunks plus the end-of-stream marker.
    pub fn accept_subscriber(&self) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        let (id, rx) = self.registry.accept(ClientRole::SfuSubscriber);
        let retained = self.last_buffer.lock().unwrap().clone();
        if let Some(buffer) = retained {
            self.log(&format!(
                "Replaying {} retained bytes to new subscriber",
                buffer.len()
            ));
            for chunk in self.encode_chunks(&buffer) {
                self.registry.send_to(id, ClientFrame::Binary(chunk));
            }
            self.registry
                .send_to(id, ClientFrame::Binary(self.end_marker()));
        }
        (id, rx)
    }

    /// Detached synthesis: handlers reply 202 before this runs.
    pub fn spawn_generate(self: Arc<Self>, text: String) {
        tokio::spawn(async move {
            if let Err(e) = self.clone().generate(text).await {
                self.log(&format!("Generate failed: {}", e));
            }
        });
    }

    async fn generate(self: Arc<Self>, text: String) -> Result<()> {
        let result = self.clone().generate_streaming(&text).await;
        if let Err(e) = result {
            self.log(&format!("Streaming synthesis failed: {}, using HTTP fallback", e));
            self.generate_fallback(&text).await?;
        }
        self.store
            .schedule_inactivity(now_ms() + DEFAULT_INACTIVITY_TIMEOUT_MS)
            .await?;
        Ok(())
    }

    async fn generate_streaming(self: Arc<Self>, text: &str) -> Result<()> {
        let handle = self.clone().ensure_upstream().await?;
        handle
            .send_text(json!({"type": "Speak", "text": text}).to_string())
            .await?;
        handle.send_text(json!({"type": "Flush"}).to_string()).await?;
        Ok(())
    }

    /// One-shot HTTP synthesis when the streaming path is down: fetch the
    /// whole 24 kHz mono buffer, transcode, broadcast, finalize.
    async fn generate_fallback(&self, text: &str) -> Result<()> {
        let snap = self.store.snapshot().await;
        let voice = snap
            .selected_voice
            .unwrap_or_else(|| DEFAULT_VOICE.to_string());
        let response = self
            .http
            .post(self.config.tts_http_url(&voice))
            .bearer_auth(&self.config.speech_api_token)
            .json(&json!({"text": text}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "HTTP TTS returned {}",
                response.status()
            )));
        }
        let pcm24 = response.bytes().await?;

        // The streaming transcoder belongs to the socket path; a one-shot
        // buffer goes through a fresh scalar pass.
        let mut transcoder = AudioTranscoder::scalar(24_000, 48_000);
        let stereo = mono_to_stereo(&transcoder.process(&pcm24));
        self.broadcast_media(&stereo);
        self.finish_run(stereo);
        Ok(())
    }

    /// Close everything publish created. Idempotent at the SFU level; a
    /// never-published session is a 400.
    pub async fn unpublish(&self) -> Result<()> {
        let snap = self.store.snapshot().await;
        if snap.upstream_adapter_id.is_none() && snap.upstream_session_id.is_none() {
            return Err(Error::Precondition("not published".into()));
        }

        self.store
            .update(
                StatePatch {
                    allow_reconnect: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await?;
        if let Some(handle) = self.connector.take().await {
            handle.close().await;
        }
        if let Some(adapter_id) = &snap.upstream_adapter_id {
            self.sfu.close_websocket_adapter(adapter_id).await?;
        }
        self.registry
            .close_role(ClientRole::SfuSubscriber, 1000, "Track unpublished");

        *self.last_buffer.lock().unwrap() = None;
        self.run.lock().await.clear();
        self.store
            .update(
                StatePatch {
                    upstream_session_id: Some(None),
                    upstream_adapter_id: Some(None),
                    selected_voice: Some(None),
                    cleanup_deadline: Some(None),
                    reconnect_attempts: Some(0),
                    reconnect_deadline: Some(None),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.log("Unpublished");
        Ok(())
    }

    /// Hard teardown: close the upstream, close every client, wipe state,
    /// drop the persisted record and alarm.
    pub async fn destroy(&self) -> Result<()> {
        if let Some(task) = self.alarm_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(handle) = self.connector.take().await {
            handle.close().await;
        }
        self.registry.close_all(1000, "Session destroyed");
        *self.last_buffer.lock().unwrap() = None;
        self.run.lock().await.clear();
        self.store.update(StatePatch::wipe(), true).await?;
        self.store.destroy().await?;
        self.log("Destroyed");
        Ok(())
    }

    /// Socket task callback: the subscriber dropped; arm the cleanup check.
    pub async fn on_client_disconnect(&self, id: Uuid) {
        self.registry.remove(id);
        if let Err(e) = self.store.schedule_cleanup().await {
            self.log(&format!("Cleanup scheduling failed: {}", e));
        }
    }

    pub fn client_count(&self) -> usize {
        self.registry.total_open()
    }

    // ── upstream plumbing ──

    async fn ensure_upstream(self: Arc<Self>) -> Result<UpstreamHandle> {
        let this = self.clone();
        self.connector
            .connect(|| async move {
                let snap = this.store.snapshot().await;
                let voice = snap
                    .selected_voice
                    .unwrap_or_else(|| DEFAULT_VOICE.to_string());
                let url = this.config.tts_ws_url(&voice);
                let label = format!("tts-{}", this.session_name);
                let (handle, events) =
                    open_link(&url, &this.config.speech_api_token, &label).await?;
                clear_reconnect(&this.store).await?;
                this.clone().spawn_event_pump(events);
                Ok(handle)
            })
            .await
    }

    fn spawn_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<UpstreamEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    UpstreamEvent::Binary(pcm24) => self.on_upstream_audio(&pcm24).await,
                    UpstreamEvent::Text(text) => match TtsControl::parse(&text) {
                        Some(TtsControl::Flushed) => self.on_flushed().await,
                        Some(TtsControl::Other) => {}
                        None => self.log(&format!("Ignoring malformed upstream message: {}", text)),
                    },
                    UpstreamEvent::Closed => {
                        self.on_upstream_closed().await;
                        break;
                    }
                }
            }
        });
    }

    /// Each provider PCM chunk is transcoded and fanned out immediately; the
    /// stereo output also accumulates for the late-joiner buffer.
    async fn on_upstream_audio(&self, pcm24: &[u8]) {
        let mono48 = self.transcoder.lock().await.process(pcm24);
        let stereo = mono_to_stereo(&mono48);
        self.run.lock().await.extend_from_slice(&stereo);
        self.broadcast_media(&stereo);
    }

    /// Flushed: drain the transcoder tail, retain the run for late joiners,
    /// and mark end-of-stream with a zero-length packet.
    async fn on_flushed(&self) {
        let tail = self.transcoder.lock().await.flush();
        if !tail.is_empty() {
            let stereo = mono_to_stereo(&tail);
            self.run.lock().await.extend_from_slice(&stereo);
            self.broadcast_media(&stereo);
        }
        let pending = std::mem::take(&mut *self.run.lock().await);
        self.finish_run(pending);
    }

    fn finish_run(&self, stereo: Vec<u8>) {
        self.log(&format!("Finalized run of {} bytes", stereo.len()));
        *self.last_buffer.lock().unwrap() = Some(Bytes::from(stereo));
        self.registry
            .fan_out(ClientRole::SfuSubscriber, ClientFrame::Binary(self.end_marker()));
    }

    async fn on_upstream_closed(&self) {
        self.log("Upstream closed");
        let snap = self.store.snapshot().await;
        if snap.allow_reconnect {
            if let Err(e) = schedule_reconnect(&self.store, &format!("tts-{}", self.session_name)).await
            {
                self.log(&format!("Reconnect scheduling failed: {}", e));
            }
        }
    }

    fn broadcast_media(&self, stereo: &[u8]) {
        for chunk in self.encode_chunks(stereo) {
            self.registry
                .fan_out(ClientRole::SfuSubscriber, ClientFrame::Binary(chunk));
        }
    }

    fn encode_chunks(&self, payload: &[u8]) -> Vec<Bytes> {
        payload
            .chunks(MEDIA_CHUNK_BYTES)
            .map(|chunk| {
                let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
                packet::encode(seq, now_ms() as u32, chunk)
            })
            .collect()
    }

    fn end_marker(&self) -> Bytes {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        packet::encode(seq, now_ms() as u32, &[])
    }

    // ── alarm reducer ──

    /// Single deadline handler: cleanup, inactivity, reconnect, in that
    /// order, at most one action per expired deadline, one merged write.
    pub async fn alarm(self: Arc<Self>) {
        let now = now_ms();
        let snap = self.store.snapshot().await;
        let mut patch = StatePatch::default();

        if snap.cleanup_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.cleanup_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Last subscriber gone");
                // The session winds down after the usual idle window.
                patch.inactivity_deadline = Some(Some(now + DEFAULT_INACTIVITY_TIMEOUT_MS));
            }
        }

        if snap.inactivity_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.inactivity_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Inactive, closing upstream");
                patch.allow_reconnect = Some(false);
                if let Some(handle) = self.connector.take().await {
                    handle.close().await;
                }
            }
        }

        let mut attempt_reconnect = false;
        if snap.reconnect_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.reconnect_deadline = Some(None);
            attempt_reconnect = snap.allow_reconnect && patch.allow_reconnect != Some(false);
        }

        if !patch.is_empty() {
            if let Err(e) = self.store.update(patch, false).await {
                self.log(&format!("Alarm write failed: {}", e));
            }
        }

        if attempt_reconnect {
            match self.clone().ensure_upstream().await {
                Ok(_) => self.log("Upstream reconnected"),
                Err(e) => {
                    self.log(&format!("Reconnect attempt failed: {}", e));
                    let _ =
                        schedule_reconnect(&self.store, &format!("tts-{}", self.session_name)).await;
                }
            }
        }
    }
}

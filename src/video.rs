//! Video session adapter: camera track in, JPEG frames out to viewers.
//!
//! Publishes the browser camera into the SFU, pulls it back as JPEG frames
//! over a WebSocket adapter, and fans the raw bytes out to viewer sockets.
//! The most recent frame is retained so a late joiner sees a picture
//! immediately. No provider link, no send queue, no keepalive.

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::packet;
use crate::registry::{ClientFrame, ClientRegistry, ClientRole};
use crate::sfu::SfuClient;
use crate::state::StatePatch;
use crate::store::{now_ms, spawn_alarm_task, StateStore, StoreBackend, DEFAULT_INACTIVITY_TIMEOUT_MS};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct VideoAdapter {
    session_name: String,
    config: BridgeConfig,
    sfu: Arc<SfuClient>,
    store: StateStore,
    registry: ClientRegistry,
    last_frame: StdMutex<Option<Bytes>>,
    alarm_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VideoAdapter {
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
            last_frame: StdMutex::new(None),
            alarm_task: StdMutex::new(None),
        });
        let task = {
            let this = adapter.clone();
            spawn_alarm_task(
                adapter.store.alarm_rx(),
                format!("video-{}", session_name),
                move || {
                    let this = this.clone();
                    async move { this.alarm().await }
                },
            )
        };
        *adapter.alarm_task.lock().unwrap() = Some(task);
        Ok(adapter)
    }

    fn log(&self, msg: &str) {
        eprintln!("[Video {}] {}", self.session_name, msg);
    }

    // ── endpoints ──

    /// Publish the camera into the SFU via auto-discovery.
    pub async fn connect(&self, session_description: &Value) -> Result<Value> {
        let discovered = self
            .sfu
            .add_tracks_auto_discover(session_description, "video")
            .await?;
        let track = discovered
            .track_names
            .first()
            .cloned()
            .ok_or_else(|| Error::BadPayload("no video track in offer".into()))?;
        self.log(&format!(
            "Camera published into SFU session {} as {}",
            discovered.session_id, track
        ));
        self.store
            .update(
                StatePatch {
                    upstream_session_id: Some(Some(discovered.session_id.clone())),
                    video_track_name: Some(Some(track)),
                    ..Default::default()
                },
                false,
            )
            .await?;
        if self.registry.total_open() == 0 {
            self.store
                .schedule_inactivity(now_ms() + DEFAULT_INACTIVITY_TIMEOUT_MS)
                .await?;
        }
        Ok(discovered.answer)
    }

    /// Bind the camera track to our sfu-subscribe endpoint with JPEG output.
    /// Idempotent.
    pub async fn start_forwarding(&self) -> Result<Value> {
        let snap = self.store.snapshot().await;
        let session_id = snap
            .upstream_session_id
            .ok_or_else(|| Error::Precondition("connect not called".into()))?;
        if let Some(adapter_id) = snap.upstream_adapter_id {
            self.log("Forwarding already active");
            return Ok(json!({ "adapterId": adapter_id, "alreadyActive": true }));
        }
        let track = snap
            .video_track_name
            .ok_or_else(|| Error::Precondition("connect not called".into()))?;
        let endpoint = self.config.video_subscribe_endpoint(&self.session_name);

        let adapter = self
            .sfu
            .pull_track_to_websocket(&session_id, &track, &endpoint, "jpeg")
            .await?;
        self.log(&format!("Forwarding started (adapter {})", adapter.adapter_id));
        self.store
            .update(
                StatePatch {
                    upstream_adapter_id: Some(Some(adapter.adapter_id.clone())),
                    ..Default::default()
                },
                false,
            )
            .await?;
        Ok(adapter.json)
    }

    /// Unbind the camera track. Idempotent.
    pub async fn stop_forwarding(&self) -> Result<()> {
        let snap = self.store.snapshot().await;
        if let Some(adapter_id) = &snap.upstream_adapter_id {
            self.sfu.close_websocket_adapter(adapter_id).await?;
            self.store
                .update(
                    StatePatch {
                        upstream_adapter_id: Some(None),
                        ..Default::default()
                    },
                    false,
                )
                .await?;
        }
        self.log("Forwarding stopped");
        Ok(())
    }

    /// Accept the SFU-side JPEG socket (single subscriber).
    pub fn accept_sfu_video(&self) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        self.registry.accept(ClientRole::SfuVideo)
    }

    /// Accept a viewer; a late joiner immediately receives the retained
    /// frame.
    pub fn accept_viewer(&self) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        let (id, rx) = self.registry.accept(ClientRole::Viewer);
        let retained = self.last_frame.lock().unwrap().clone();
        if let Some(frame) = retained {
            self.registry.send_to(id, ClientFrame::Binary(frame));
        }
        (id, rx)
    }

    /// Binary frame from the SFU video socket: decode, retain, fan out.
    pub fn on_sfu_frame(&self, frame: &[u8]) {
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
        let jpeg = Bytes::copy_from_slice(&pkt.payload);
        *self.last_frame.lock().unwrap() = Some(jpeg.clone());
        self.registry
            .fan_out(ClientRole::Viewer, ClientFrame::Binary(jpeg));
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
        self.registry.close_all(1000, "Session destroyed");
        *self.last_frame.lock().unwrap() = None;
        self.store.update(StatePatch::wipe(), true).await?;
        self.store.destroy().await?;
        self.log("Destroyed");
        Ok(())
    }

    // ── alarm reducer ──

    /// Deadline handler: cleanup then inactivity; one merged write.
    pub async fn alarm(self: Arc<Self>) {
        let now = now_ms();
        let snap = self.store.snapshot().await;
        let mut patch = StatePatch::default();

        if snap.cleanup_deadline.map(|d| d <= now).unwrap_or(false) {
            patch.cleanup_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Last viewer gone");
                patch.inactivity_deadline = Some(Some(now + DEFAULT_INACTIVITY_TIMEOUT_MS));
            }
        }

        if snap.inactivity_deadline.map(|d| d <= now).unwrap_or(false)
            && patch.inactivity_deadline.is_none()
        {
            patch.inactivity_deadline = Some(None);
            if self.registry.total_open() == 0 {
                self.log("Inactive, closing viewers");
                self.registry.close_role(ClientRole::Viewer, 1000, "Session inactive");
            }
        }

        if !patch.is_empty() {
            if let Err(e) = self.store.update(patch, false).await {
                self.log(&format!("Alarm write failed: {}", e));
            }
        }
    }
}

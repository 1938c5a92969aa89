//! Shared server state: one adapter instance per session name per flavor.

use mediabridge::{
    BridgeConfig, Result, SfuClient, StoreBackend, SttAdapter, TtsAdapter, VideoAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct AppState {
    pub config: BridgeConfig,
    pub sfu: Arc<SfuClient>,
    tts: Mutex<HashMap<String, Arc<TtsAdapter>>>,
    stt: Mutex<HashMap<String, Arc<SttAdapter>>>,
    video: Mutex<HashMap<String, Arc<VideoAdapter>>>,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        let sfu = Arc::new(SfuClient::new(&config));
        Self {
            config,
            sfu,
            tts: Mutex::new(HashMap::new()),
            stt: Mutex::new(HashMap::new()),
            video: Mutex::new(HashMap::new()),
        }
    }

    /// One live TTS adapter per session name. The map lock is held across
    /// restore so no handler observes a half-initialized instance.
    pub async fn tts(&self, sid: &str) -> Result<Arc<TtsAdapter>> {
        let mut map = self.tts.lock().await;
        if let Some(adapter) = map.get(sid) {
            return Ok(adapter.clone());
        }
        let backend = StoreBackend::file(&self.config.state_dir, &format!("{}.tts", sid));
        let adapter =
            TtsAdapter::create(sid, self.config.clone(), self.sfu.clone(), backend).await?;
        map.insert(sid.to_string(), adapter.clone());
        Ok(adapter)
    }

    pub async fn stt(&self, sid: &str) -> Result<Arc<SttAdapter>> {
        let mut map = self.stt.lock().await;
        if let Some(adapter) = map.get(sid) {
            return Ok(adapter.clone());
        }
        let backend = StoreBackend::file(&self.config.state_dir, &format!("{}.stt", sid));
        let adapter =
            SttAdapter::create(sid, self.config.clone(), self.sfu.clone(), backend).await?;
        map.insert(sid.to_string(), adapter.clone());
        Ok(adapter)
    }

    pub async fn video(&self, sid: &str) -> Result<Arc<VideoAdapter>> {
        let mut map = self.video.lock().await;
        if let Some(adapter) = map.get(sid) {
            return Ok(adapter.clone());
        }
        let backend = StoreBackend::file(&self.config.state_dir, &format!("{}.video", sid));
        let adapter =
            VideoAdapter::create(sid, self.config.clone(), self.sfu.clone(), backend).await?;
        map.insert(sid.to_string(), adapter.clone());
        Ok(adapter)
    }

    /// Destroy all flavors of a session and drop the instances.
    pub async fn destroy_session(&self, sid: &str) {
        if let Some(adapter) = self.tts.lock().await.remove(sid) {
            if let Err(e) = adapter.destroy().await {
                eprintln!("[Server] TTS destroy failed for {}: {}", sid, e);
            }
        }
        if let Some(adapter) = self.stt.lock().await.remove(sid) {
            if let Err(e) = adapter.destroy().await {
                eprintln!("[Server] STT destroy failed for {}: {}", sid, e);
            }
        }
        if let Some(adapter) = self.video.lock().await.remove(sid) {
            if let Err(e) = adapter.destroy().await {
                eprintln!("[Server] Video destroy failed for {}: {}", sid, e);
            }
        }
    }
}

//! Runtime configuration pulled from the environment.
//!
//! The bridge talks to two external services: the SFU REST API and the
//! streaming speech provider (TTS + STT over WebSocket, plus a one-shot HTTP
//! TTS fallback). All endpoints, identifiers and tokens come from the
//! environment; timeouts and batch sizes are compile-time constants in the
//! modules that own them.

use std::path::PathBuf;

/// Configuration for the media bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// SFU REST API base, e.g. `https://rtc.example.com/v1`
    pub sfu_api_base: String,
    /// SFU application identifier (path component of every REST call)
    pub sfu_app_id: String,
    /// SFU bearer token
    pub sfu_app_token: String,
    /// Speech provider host, e.g. `api.deepgram.com`
    pub speech_api_host: String,
    /// Speech provider bearer token
    pub speech_api_token: String,
    /// TTS model identifier passed on the upstream URL
    pub tts_model: String,
    /// STT model identifier passed on the upstream URL
    pub stt_model: String,
    /// Publicly reachable base URL of this server; the SFU connects back to
    /// `{public_base_url}/<sid>/...` WebSocket endpoints
    pub public_base_url: String,
    /// Directory for persisted per-session state
    pub state_dir: PathBuf,
}

impl BridgeConfig {
    /// Build a config from environment variables, with development defaults
    /// for everything except the two bearer tokens (empty when unset; the
    /// respective service will reject calls until provided).
    pub fn from_env() -> Self {
        Self {
            sfu_api_base: env_or("SFU_API_BASE", "https://rtc.live.example.com/v1"),
            sfu_app_id: env_or("SFU_APP_ID", ""),
            sfu_app_token: env_or("SFU_APP_TOKEN", ""),
            speech_api_host: env_or("SPEECH_API_HOST", "api.deepgram.com"),
            speech_api_token: env_or("SPEECH_API_TOKEN", ""),
            tts_model: env_or("TTS_MODEL", "aura-2"),
            stt_model: env_or("STT_MODEL", "nova-3"),
            public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:8080"),
            state_dir: PathBuf::from(env_or("STATE_DIR", "./state")),
        }
    }

    /// WebSocket URL for a streaming TTS session with the given voice.
    pub fn tts_ws_url(&self, voice: &str) -> String {
        format!(
            "wss://{}/v1/speak?encoding=linear16&container=none&model={}&speaker={}",
            self.speech_api_host, self.tts_model, voice
        )
    }

    /// One-shot HTTP TTS endpoint (fallback path) for the given voice.
    pub fn tts_http_url(&self, voice: &str) -> String {
        format!(
            "https://{}/v1/speak?encoding=linear16&container=none&model={}&speaker={}",
            self.speech_api_host, self.tts_model, voice
        )
    }

    /// WebSocket URL for a streaming STT session (PCM16 mono 16 kHz in).
    pub fn stt_ws_url(&self) -> String {
        format!(
            "wss://{}/v1/listen?encoding=linear16&sample_rate=16000&model={}",
            self.speech_api_host, self.stt_model
        )
    }

    /// WebSocket endpoint the SFU pushes a synthesized track to.
    pub fn tts_subscribe_endpoint(&self, session_name: &str) -> String {
        format!("{}/{}/subscribe", self.ws_base(), session_name)
    }

    /// WebSocket endpoint the SFU pulls the microphone track to.
    pub fn stt_subscribe_endpoint(&self, session_name: &str) -> String {
        format!("{}/{}/stt/sfu-subscribe", self.ws_base(), session_name)
    }

    /// WebSocket endpoint the SFU pulls the camera track to.
    pub fn video_subscribe_endpoint(&self, session_name: &str) -> String {
        format!("{}/{}/video/sfu-subscribe", self.ws_base(), session_name)
    }

    fn ws_base(&self) -> String {
        self.public_base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            sfu_api_base: "https://sfu.test/v1".into(),
            sfu_app_id: "app1".into(),
            sfu_app_token: "tok".into(),
            speech_api_host: "speech.test".into(),
            speech_api_token: "tok2".into(),
            tts_model: "aura-2".into(),
            stt_model: "nova-3".into(),
            public_base_url: "https://bridge.test".into(),
            state_dir: PathBuf::from("/tmp/state"),
        }
    }

    #[test]
    fn test_upstream_urls() {
        let c = test_config();
        assert_eq!(
            c.tts_ws_url("zeus"),
            "wss://speech.test/v1/speak?encoding=linear16&container=none&model=aura-2&speaker=zeus"
        );
        assert_eq!(
            c.stt_ws_url(),
            "wss://speech.test/v1/listen?encoding=linear16&sample_rate=16000&model=nova-3"
        );
    }

    #[test]
    fn test_callback_endpoints_use_ws_scheme() {
        let c = test_config();
        assert_eq!(c.tts_subscribe_endpoint("s1"), "wss://bridge.test/s1/subscribe");
        assert_eq!(
            c.video_subscribe_endpoint("s1"),
            "wss://bridge.test/s1/video/sfu-subscribe"
        );
    }
}

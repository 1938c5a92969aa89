//! REST client for the SFU.
//!
//! Only the handful of operations the adapters consume. Non-2xx responses
//! surface as `Error::Sfu` with the body attached, except the one documented
//! idempotency case: closing a WebSocket adapter that is already gone
//! returns 503 with `tracks[0].errorCode == "adapter_not_found"` and counts
//! as success.

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use serde_json::{json, Value};

/// Result of publishing a track through auto-discovery.
#[derive(Debug)]
pub struct AutoDiscovered {
    /// SFU session the tracks were published into.
    pub session_id: String,
    /// The SFU's SDP answer, proxied back to the browser untouched.
    pub answer: Value,
    /// Discovered track names of the requested kind.
    pub track_names: Vec<String>,
}

/// Result of binding a track to a WebSocket adapter.
#[derive(Debug)]
pub struct WsAdapter {
    pub session_id: Option<String>,
    pub adapter_id: String,
    /// Full SFU response for the HTTP caller.
    pub json: Value,
}

pub struct SfuClient {
    http: reqwest::Client,
    api_base: String,
    app_id: String,
    token: String,
}

impl SfuClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.sfu_api_base.clone(),
            app_id: config.sfu_app_id.clone(),
            token: config.sfu_app_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/apps/{}{}", self.api_base, self.app_id, path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::Sfu {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| Error::Sfu {
            status: status.as_u16(),
            body: format!("unparseable SFU response: {} ({})", text, e),
        })
    }

    /// Create a fresh SFU session; returns its id.
    pub async fn create_session(&self) -> Result<String> {
        let value = self.post("/sessions/new", json!({})).await?;
        extract_str(&value, "sessionId")
    }

    /// Publish every track in the offer into a new SFU session, returning
    /// the answer plus the discovered track names of `kind` ("audio" or
    /// "video").
    pub async fn add_tracks_auto_discover(
        &self,
        sdp_offer: &Value,
        kind: &str,
    ) -> Result<AutoDiscovered> {
        let session_id = self.create_session().await?;
        let value = self
            .post(
                &format!("/sessions/{}/tracks/new", session_id),
                json!({
                    "autoDiscover": true,
                    "sessionDescription": sdp_offer,
                }),
            )
            .await?;
        Ok(AutoDiscovered {
            session_id,
            track_names: track_names_of_kind(&value, kind),
            answer: value,
        })
    }

    /// Pull a remote track from a publisher session into a player session.
    pub async fn pull_remote_track_to_player(
        &self,
        player_session_id: &str,
        publisher_session_id: &str,
        track_name: &str,
        sdp_offer: &Value,
    ) -> Result<Value> {
        self.post(
            &format!("/sessions/{}/tracks/new", player_session_id),
            json!({
                "tracks": [{
                    "location": "remote",
                    "sessionId": publisher_session_id,
                    "trackName": track_name,
                }],
                "sessionDescription": sdp_offer,
            }),
        )
        .await
    }

    /// Create a local track fed by a WebSocket the SFU opens to `endpoint`.
    pub async fn push_track_from_websocket(
        &self,
        track_name: &str,
        endpoint: &str,
    ) -> Result<WsAdapter> {
        let value = self
            .post(
                "/adapters/ws/push",
                json!({
                    "trackName": track_name,
                    "endpoint": endpoint,
                    "inputCodec": "pcm",
                    "mode": "buffer",
                }),
            )
            .await?;
        Ok(WsAdapter {
            session_id: value
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(String::from),
            adapter_id: extract_str(&value, "adapterId")?,
            json: value,
        })
    }

    /// Pull a published track out of the SFU to a WebSocket it opens to
    /// `endpoint`, decoded as `output_codec` ("pcm" or "jpeg").
    pub async fn pull_track_to_websocket(
        &self,
        session_id: &str,
        track_name: &str,
        endpoint: &str,
        output_codec: &str,
    ) -> Result<WsAdapter> {
        let value = self
            .post(
                "/adapters/ws/pull",
                json!({
                    "sessionId": session_id,
                    "trackName": track_name,
                    "endpoint": endpoint,
                    "outputCodec": output_codec,
                }),
            )
            .await?;
        Ok(WsAdapter {
            session_id: Some(session_id.to_string()),
            adapter_id: extract_str(&value, "adapterId")?,
            json: value,
        })
    }

    /// Tear down a WebSocket adapter. Already-gone adapters count as
    /// success.
    pub async fn close_websocket_adapter(&self, adapter_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/adapters/{}", adapter_id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() == 503 && is_adapter_not_found(&text) {
            eprintln!("[Sfu] Adapter {} already closed", adapter_id);
            return Ok(());
        }
        Err(Error::Sfu {
            status: status.as_u16(),
            body: text,
        })
    }
}

fn extract_str(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::Sfu {
            status: 200,
            body: format!("SFU response missing {}: {}", key, value),
        })
}

fn track_names_of_kind(value: &Value, kind: &str) -> Vec<String> {
    value
        .get("tracks")
        .and_then(|t| t.as_array())
        .map(|tracks| {
            tracks
                .iter()
                .filter(|t| t.get("kind").and_then(|k| k.as_str()) == Some(kind))
                .filter_map(|t| t.get("trackName").and_then(|n| n.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn is_adapter_not_found(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("tracks")?
                .as_array()?
                .first()?
                .get("errorCode")?
                .as_str()
                .map(|code| code == "adapter_not_found")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_names_filter_by_kind() {
        let value = serde_json::json!({
            "tracks": [
                {"trackName": "mic-1", "kind": "audio"},
                {"trackName": "cam-1", "kind": "video"},
                {"trackName": "mic-2", "kind": "audio"},
                {"kind": "audio"},
            ]
        });
        assert_eq!(track_names_of_kind(&value, "audio"), vec!["mic-1", "mic-2"]);
        assert_eq!(track_names_of_kind(&value, "video"), vec!["cam-1"]);
        assert!(track_names_of_kind(&serde_json::json!({}), "audio").is_empty());
    }

    #[test]
    fn test_adapter_not_found_detection() {
        assert!(is_adapter_not_found(
            r#"{"tracks":[{"errorCode":"adapter_not_found"}]}"#
        ));
        assert!(!is_adapter_not_found(
            r#"{"tracks":[{"errorCode":"internal_error"}]}"#
        ));
        assert!(!is_adapter_not_found("not json"));
        assert!(!is_adapter_not_found(r#"{"tracks":[]}"#));
    }

    #[test]
    fn test_extract_str() {
        let value = serde_json::json!({"sessionId": "abc"});
        assert_eq!(extract_str(&value, "sessionId").unwrap(), "abc");
        assert!(extract_str(&value, "adapterId").is_err());
    }
}

//! TTS endpoints: publish, connect, generate, unpublish, SFU subscribe.

use super::{err_response, ApiResponse};
use crate::state::AppState;
use crate::ws::pump_socket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub speaker: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "sessionDescription")]
    pub session_description: Value,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub text: String,
}

/// `POST /:sid/publish`
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Response {
    let adapter = match state.tts(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.publish(req.speaker).await {
        Ok(sfu_json) => Json(ApiResponse::success(sfu_json)).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/unpublish`
pub async fn unpublish(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.tts(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.unpublish().await {
        Ok(()) => Json(ApiResponse::success("unpublished")).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/connect` — proxy a player pull into a new SFU session.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let adapter = match state.tts(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.connect_player(&req.session_description).await {
        Ok(answer) => Json(ApiResponse::success(answer)).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/generate` — 202, synthesis detached.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    let adapter = match state.tts(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    adapter.spawn_generate(req.text);
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success("generation started")),
    )
        .into_response()
}

/// `WS /:sid/subscribe` — the SFU-side subscriber socket.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.tts(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    ws.on_upgrade(move |socket| async move {
        let (id, rx) = adapter.accept_subscriber();
        pump_socket(socket, rx, None).await;
        adapter.on_client_disconnect(id).await;
    })
}

//! STT endpoints: connect, forwarding control, audio ingest, transcripts.

use super::{err_response, ApiResponse};
use crate::state::AppState;
use crate::ws::pump_socket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "sessionDescription")]
    pub session_description: Value,
}

/// `POST /:sid/stt/connect` — publish the mic via auto-discovery.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.connect(&req.session_description).await {
        Ok(answer) => Json(ApiResponse::success(answer)).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/stt/start-forwarding`
pub async fn start_forwarding(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.start_forwarding().await {
        Ok(sfu_json) => Json(ApiResponse::success(sfu_json)).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/stt/stop-forwarding`
pub async fn stop_forwarding(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.stop_forwarding().await {
        Ok(()) => Json(ApiResponse::success("forwarding stopped")).into_response(),
        Err(e) => err_response(e),
    }
}

/// `POST /:sid/stt/reconnect-upstream` — debug restart.
pub async fn reconnect_upstream(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    match adapter.reconnect_upstream().await {
        Ok(msg) => Json(ApiResponse::success(msg)).into_response(),
        Err(e) => err_response(e),
    }
}

/// `WS /:sid/stt/sfu-subscribe` — SFU pushes mic PCM here.
pub async fn sfu_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    ws.on_upgrade(move |socket| async move {
        let (id, rx) = adapter.accept_sfu_audio();
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);
        let feed = {
            let adapter = adapter.clone();
            async move {
                while let Some(frame) = in_rx.recv().await {
                    adapter.clone().on_sfu_frame(&frame).await;
                }
            }
        };
        tokio::join!(pump_socket(socket, rx, Some(in_tx)), feed);
        adapter.on_client_disconnect(id).await;
    })
}

/// `WS /:sid/stt/transcription-stream` — client transcript subscriptions.
pub async fn transcription_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    let adapter = match state.stt(&sid).await {
        Ok(a) => a,
        Err(e) => return err_response(e),
    };
    ws.on_upgrade(move |socket| async move {
        let (id, rx) = adapter.accept_transcription_stream().await;
        pump_socket(socket, rx, None).await;
        adapter.on_client_disconnect(id).await;
    })
}

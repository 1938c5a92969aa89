//! HTTP and WebSocket handlers, grouped per adapter flavor.

pub mod stt;
pub mod tts;
pub mod video;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::state::AppState;

/// Generic API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Map an adapter error onto its HTTP status with the message attached.
pub fn err_response(e: mediabridge::Error) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::<Value>::error(e.to_string()))).into_response()
}

/// `DELETE /:sid` — destroy every flavor of the session.
pub async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Response {
    state.destroy_session(&sid).await;
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(format!("session {} destroyed", sid))),
    )
        .into_response()
}

pub async fn healthz() -> &'static str {
    "OK"
}

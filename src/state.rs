//! Persisted per-session control state.
//!
//! One `AdapterState` record per session, stored as a single JSON document
//! under the `"state"` key. Field absence is meaningful: a deadline that is
//! `None` is not armed, an id that is `None` was never issued (or has been
//! cleared).

use serde::{Deserialize, Serialize};

/// The single persisted record for a session adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_adapter_id: Option<String>,
    #[serde(default)]
    pub pending_finalize: bool,
    #[serde(default)]
    pub pending_close: bool,
    #[serde(default)]
    pub closing_due_to_inactivity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_track_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfu_callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_track_name: Option<String>,
}

impl AdapterState {
    /// Earliest of the currently defined deadline fields, if any.
    pub fn earliest_deadline(&self) -> Option<u64> {
        [
            self.reconnect_deadline,
            self.inactivity_deadline,
            self.cleanup_deadline,
            self.keep_alive_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(v) = patch.session_name {
            self.session_name = Some(v);
        }
        if let Some(v) = patch.allow_reconnect {
            self.allow_reconnect = v;
        }
        if let Some(v) = patch.reconnect_attempts {
            self.reconnect_attempts = v;
        }
        if let Some(v) = patch.reconnect_deadline {
            self.reconnect_deadline = v;
        }
        if let Some(v) = patch.inactivity_deadline {
            self.inactivity_deadline = v;
        }
        if let Some(v) = patch.cleanup_deadline {
            self.cleanup_deadline = v;
        }
        if let Some(v) = patch.keep_alive_deadline {
            self.keep_alive_deadline = v;
        }
        if let Some(v) = patch.upstream_session_id {
            self.upstream_session_id = v;
        }
        if let Some(v) = patch.upstream_adapter_id {
            self.upstream_adapter_id = v;
        }
        if let Some(v) = patch.pending_finalize {
            self.pending_finalize = v;
        }
        if let Some(v) = patch.pending_close {
            self.pending_close = v;
        }
        if let Some(v) = patch.closing_due_to_inactivity {
            self.closing_due_to_inactivity = v;
        }
        if let Some(v) = patch.selected_voice {
            self.selected_voice = v;
        }
        if let Some(v) = patch.mic_track_name {
            self.mic_track_name = v;
        }
        if let Some(v) = patch.sfu_callback_url {
            self.sfu_callback_url = v;
        }
        if let Some(v) = patch.video_track_name {
            self.video_track_name = v;
        }
    }
}

/// Partial update over `AdapterState`. Outer `None` leaves the field alone;
/// for optional fields, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub session_name: Option<String>,
    pub allow_reconnect: Option<bool>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_deadline: Option<Option<u64>>,
    pub inactivity_deadline: Option<Option<u64>>,
    pub cleanup_deadline: Option<Option<u64>>,
    pub keep_alive_deadline: Option<Option<u64>>,
    pub upstream_session_id: Option<Option<String>>,
    pub upstream_adapter_id: Option<Option<String>>,
    pub pending_finalize: Option<bool>,
    pub pending_close: Option<bool>,
    pub closing_due_to_inactivity: Option<bool>,
    pub selected_voice: Option<Option<String>>,
    pub mic_track_name: Option<Option<String>>,
    pub sfu_callback_url: Option<Option<String>>,
    pub video_track_name: Option<Option<String>>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.session_name.is_none()
            && self.allow_reconnect.is_none()
            && self.reconnect_attempts.is_none()
            && self.reconnect_deadline.is_none()
            && self.inactivity_deadline.is_none()
            && self.cleanup_deadline.is_none()
            && self.keep_alive_deadline.is_none()
            && self.upstream_session_id.is_none()
            && self.upstream_adapter_id.is_none()
            && self.pending_finalize.is_none()
            && self.pending_close.is_none()
            && self.closing_due_to_inactivity.is_none()
            && self.selected_voice.is_none()
            && self.mic_track_name.is_none()
            && self.sfu_callback_url.is_none()
            && self.video_track_name.is_none()
    }

    /// A patch that clears every deadline, id, flag and media selection.
    /// Used by destroy.
    pub fn wipe() -> Self {
        Self {
            allow_reconnect: Some(false),
            reconnect_attempts: Some(0),
            reconnect_deadline: Some(None),
            inactivity_deadline: Some(None),
            cleanup_deadline: Some(None),
            keep_alive_deadline: Some(None),
            upstream_session_id: Some(None),
            upstream_adapter_id: Some(None),
            pending_finalize: Some(false),
            pending_close: Some(false),
            closing_due_to_inactivity: Some(false),
            selected_voice: Some(None),
            mic_track_name: Some(None),
            sfu_callback_url: Some(None),
            video_track_name: Some(None),
            ..Default::default()
        }
    }
}

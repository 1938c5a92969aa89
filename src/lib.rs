//! # mediabridge
//!
//! Per-session real-time media control plane between a browser (WebRTC
//! peer), an SFU with a WebSocket media adapter, and streaming speech
//! services (TTS and STT).
//!
//! For each human-named session the bridge orchestrates three flows:
//!
//! - **TTS**: `generate(text)` -> provider synthesizes PCM -> transcode
//!   24 kHz mono to 48 kHz stereo -> encoded packets to the SFU-side
//!   subscriber socket -> listeners.
//! - **STT**: SFU pushes microphone PCM -> transcode 48 kHz stereo to
//!   16 kHz mono -> bounded send queue -> provider -> JSON transcripts fan
//!   out to subscribed clients.
//! - **Video**: SFU pushes JPEG frames -> raw bytes fan out to viewer
//!   sockets, retaining the latest frame for late joiners.
//!
//! Each session is a single adapter instance: control state persists in a
//! durable store, deferred work runs through a deadline-driven alarm
//! reducer, and the upstream provider socket reconnects with exponential
//! backoff. The HTTP/WebSocket routing shell lives in the `server` binary.

pub mod config;
pub mod connector;
mod error;
pub mod packet;
pub mod registry;
pub mod send_queue;
pub mod sfu;
pub mod state;
pub mod store;
pub mod stt;
pub mod transcode;
pub mod tts;
pub mod upstream;
pub mod video;

pub use error::{Error, Result};

pub use config::BridgeConfig;
pub use connector::DedupedConnector;
pub use packet::Packet;
pub use registry::{ClientFrame, ClientRegistry, ClientRole};
pub use send_queue::SendQueue;
pub use sfu::SfuClient;
pub use state::{AdapterState, StatePatch};
pub use store::{now_ms, StateStore, StoreBackend, DEFAULT_INACTIVITY_TIMEOUT_MS};
pub use stt::SttAdapter;
pub use transcode::AudioTranscoder;
pub use tts::TtsAdapter;
pub use upstream::{UpstreamEvent, UpstreamHandle};
pub use video::VideoAdapter;

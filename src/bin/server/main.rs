//! Media bridge server.
//!
//! Routes every `/<sid>/...` prefix to exactly one adapter instance per
//! flavor for that session name.
//!
//! API Endpoints:
//!   GET    /healthz                        - Liveness check
//!   DELETE /:sid                           - Destroy all session adapters
//!   POST   /:sid/publish                   - Publish TTS track {speaker}
//!   POST   /:sid/unpublish                 - Tear the TTS track down
//!   POST   /:sid/connect                   - Player pull {sessionDescription}
//!   POST   /:sid/generate                  - Synthesize {text} (202)
//!   WS     /:sid/subscribe                 - SFU-side TTS subscriber
//!   POST   /:sid/stt/connect               - Publish mic {sessionDescription}
//!   POST   /:sid/stt/start-forwarding      - Pull mic to our endpoint
//!   POST   /:sid/stt/stop-forwarding       - Stop pulling, finalize
//!   POST   /:sid/stt/reconnect-upstream    - Debug upstream restart
//!   WS     /:sid/stt/sfu-subscribe         - SFU-side mic PCM
//!   WS     /:sid/stt/transcription-stream  - Client transcript stream
//!   POST   /:sid/video/connect             - Publish camera {sessionDescription}
//!   POST   /:sid/video/start-forwarding    - Pull camera as JPEG
//!   POST   /:sid/video/stop-forwarding     - Stop pulling
//!   WS     /:sid/video/sfu-subscribe       - SFU-side JPEG frames
//!   WS     /:sid/video/viewer              - Client JPEG stream
//!
//! The publisher/player UI pages are static files under --frontend.

mod api;
mod state;
mod ws;

use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use mediabridge::BridgeConfig;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir};

#[derive(Parser)]
#[command(name = "mediabridge-server")]
#[command(about = "Real-time media bridge between an SFU and streaming speech services")]
struct Args {
    /// HTTP/WebSocket server port
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Path to the static frontend (publisher/player pages)
    #[arg(long, env = "FRONTEND_PATH", default_value = "./frontend")]
    frontend: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = BridgeConfig::from_env();

    eprintln!("===========================================");
    eprintln!("  Media Bridge Server");
    eprintln!("===========================================");
    eprintln!("Port: {}", args.port);
    eprintln!("SFU API: {}", config.sfu_api_base);
    eprintln!("Speech provider: {}", config.speech_api_host);
    eprintln!("TTS model: {}", config.tts_model);
    eprintln!("STT model: {}", config.stt_model);
    eprintln!("Public base URL: {}", config.public_base_url);
    eprintln!("State dir: {}", config.state_dir.display());
    eprintln!("===========================================");
    eprintln!();

    tokio::fs::create_dir_all(&config.state_dir).await?;
    let state = Arc::new(AppState::new(config));

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        // TTS
        .route("/:sid/publish", post(api::tts::publish))
        .route("/:sid/unpublish", post(api::tts::unpublish))
        .route("/:sid/connect", post(api::tts::connect))
        .route("/:sid/generate", post(api::tts::generate))
        .route("/:sid/subscribe", get(api::tts::subscribe))
        // STT
        .route("/:sid/stt/connect", post(api::stt::connect))
        .route("/:sid/stt/start-forwarding", post(api::stt::start_forwarding))
        .route("/:sid/stt/stop-forwarding", post(api::stt::stop_forwarding))
        .route(
            "/:sid/stt/reconnect-upstream",
            post(api::stt::reconnect_upstream),
        )
        .route("/:sid/stt/sfu-subscribe", get(api::stt::sfu_subscribe))
        .route(
            "/:sid/stt/transcription-stream",
            get(api::stt::transcription_stream),
        )
        // Video
        .route("/:sid/video/connect", post(api::video::connect))
        .route(
            "/:sid/video/start-forwarding",
            post(api::video::start_forwarding),
        )
        .route(
            "/:sid/video/stop-forwarding",
            post(api::video::stop_forwarding),
        )
        .route("/:sid/video/sfu-subscribe", get(api::video::sfu_subscribe))
        .route("/:sid/video/viewer", get(api::video::viewer))
        // Session teardown
        .route("/:sid", delete(api::destroy_session))
        // Publisher/player pages
        .fallback_service(ServeDir::new(&args.frontend))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

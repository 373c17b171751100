//! # Voice Call Backend
//!
//! A live voice call against a bidirectional speech service: microphone audio
//! streams out, synthesized audio streams back and is scheduled for gap-free
//! playback, and both sides are transcribed turn by turn.
//!
//! ## Application Architecture:
//! - **audio**: PCM codec, playback scheduler, microphone capture pump
//! - **live**: wire protocol, transport session, turn assembly, session controller
//! - **config**: application configuration (TOML file + environment variables)
//! - **state**: shared application state and call counters
//! - **health** / **handlers**: HTTP endpoints
//! - **websocket**: the `/ws/call` bridge a browser uses to drive a call
//! - **error**: HTTP and call error types

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod live;
pub mod state;
pub mod websocket;

use actix_web::web;

/// Register every route the server exposes.
///
/// ## Routes:
/// - `GET /health` and `GET /api/v1/health`: liveness and call load
/// - `GET /api/v1/config`, `PUT /api/v1/config`: runtime configuration
/// - `GET /ws/call`: WebSocket call bridge
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config)),
    )
    .route("/health", web::get().to(health::health_check))
    .route("/ws/call", web::get().to(websocket::call_websocket));
}

//! # Health Endpoint
//!
//! Liveness plus a small picture of the call load and which speech model and
//! voice new calls will use. The API key is never reported; only whether one
//! is configured.

use crate::config::AppConfig;
use crate::state::{AppState, CallMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "started": metrics.calls_started,
            "failed": metrics.calls_failed,
            "rejected": metrics.calls_rejected,
            "active": metrics.active_calls
        },
        "live": {
            "model": config.live.model,
            "voice_name": config.live.voice_name,
            "api_key_configured": !config.live.api_key.is_empty()
        },
        "system": load_status(&config, &metrics)
    }))
}

fn load_status(config: &AppConfig, metrics: &CallMetrics) -> serde_json::Value {
    let max_calls = config.performance.max_concurrent_calls;
    let usage = if max_calls > 0 {
        metrics.active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "at_capacity"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": metrics.active_calls
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_hides_api_key() {
        let mut config = AppConfig::default();
        config.live.api_key = "secret-key".to_string();
        let state = AppState::new(config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live"]["voice_name"], "Zephyr");
        assert_eq!(body["live"]["api_key_configured"], true);
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_load_status_levels() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_calls = 4;

        let mut metrics = CallMetrics::default();
        assert_eq!(load_status(&config, &metrics)["status"], "normal");

        metrics.active_calls = 3;
        assert_eq!(load_status(&config, &metrics)["status"], "moderate_load");

        metrics.active_calls = 4;
        let status = load_status(&config, &metrics);
        assert_eq!(status["status"], "at_capacity");
        assert_eq!(status["call_usage_percent"], 100.0);
    }
}

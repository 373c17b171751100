use crate::{config::AppConfig, error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as reported over HTTP. The API key is replaced by a flag.
fn public_config(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "live": {
            "endpoint": config.live.endpoint,
            "api_key_configured": !config.live.api_key.is_empty(),
            "model": config.live.model,
            "voice_name": config.live.voice_name,
            "system_instruction": config.live.system_instruction,
            "connect_timeout_ms": config.live.connect_timeout_ms
        },
        "audio": {
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "channels": config.audio.channels,
            "capture_frame_size": config.audio.capture_frame_size
        },
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": public_config(&config)
    })))
}

/// Apply a partial update. Takes effect for calls started afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(
        model = %current_config.live.model,
        voice = %current_config.live.voice_name,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": public_config(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.live.api_key = "secret-key".to_string();
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_redacts_key() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["live"]["api_key_configured"], true);
        assert_eq!(body["config"]["audio"]["capture_frame_size"], 4096);
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_update_config_applies_partial_change() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"live": {"voice_name": "Puck"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_config().live.voice_name, "Puck");
        assert_eq!(state.get_config().live.api_key, "secret-key");
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_frame_size() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"capture_frame_size": 1000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().audio.capture_frame_size, 4096);
    }
}

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "[redacted]";

/// Effective configuration with the API key replaced, so the endpoint can be
/// exposed to operators without leaking credentials.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = redacted(state.get_config())?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

fn redacted(config: &AppConfig) -> AppResult<serde_json::Value> {
    let mut value = serde_json::to_value(config)
        .map_err(|e| AppError::Internal(format!("failed to serialize configuration: {}", e)))?;
    if let Some(api_key) = value.pointer_mut("/gemini/api_key") {
        *api_key = if config.has_api_key() {
            json!(REDACTED)
        } else {
            json!("")
        };
    }
    Ok(value)
}

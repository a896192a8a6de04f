use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config()
    })))
}

/// Merge a partial JSON object into the live config.
///
/// New sessions use the merged values; a running pipeline keeps the
/// config it was started with until it is restarted.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    state.update_config(updated.clone())?;
    info!("Configuration updated at runtime");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "pipelineRunning": state.pipeline.is_running(),
        "updated_config": updated
    })))
}

pub mod audio;
pub mod config;
pub mod models;
pub mod purity;
pub mod sessions;
mod upload;

pub use audio::*;
pub use self::config::*;
pub use models::*;
pub use purity::*;
pub use sessions::*;

use crate::health;
use crate::websocket;
use actix_web::web;

/// Register every `/api/v1` route on the enclosing scope.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .route("/config", web::get().to(get_config))
        .route("/config", web::put().to(update_config))
        .route("/models", web::get().to(get_models))
        .route("/audio/analyze", web::post().to(analyze_audio))
        .service(
            web::scope("/sessions")
                .route("", web::post().to(create_session))
                .route("/{id}", web::get().to(get_session))
                .route("/{id}", web::delete().to(delete_session))
                .route("/{id}/reset", web::post().to(reset_session))
                .route("/{id}/item", web::put().to(set_item))
                .route("/{id}/frame", web::post().to(submit_frame))
                .route("/{id}/audio", web::post().to(submit_audio)),
        )
        .service(
            web::scope("/purity")
                .route("/status", web::get().to(pipeline_status))
                .route("/cameras", web::get().to(list_cameras))
                .route("/start", web::post().to(start_pipeline))
                .route("/stop", web::post().to(stop_pipeline))
                .route("/reset", web::post().to(reset_pipeline))
                .route("/frame", web::get().to(latest_frame))
                .route("/mjpeg", web::get().to(mjpeg_stream))
                .route("/stream", web::get().to(websocket::stream_ws)),
        );
}

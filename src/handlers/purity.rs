//! # Device Pipeline API
//!
//! Controls the single shared capture/process pipeline and exposes its output.
//! The websocket gateway at `/purity/stream` lives in `websocket.rs`.

use crate::error::AppResult;
use crate::handlers::upload::blocking;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const MJPEG_POLL_INTERVAL: Duration = Duration::from_millis(33);
const MJPEG_BOUNDARY: &str = "frame";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub camera_index: u32,
}

/// Reads the published snapshot; never waits on the pipeline session.
pub async fn pipeline_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.pipeline.status())
}

pub async fn list_cameras(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let max_cameras = state.get_config().pipeline.max_cameras;
    let pipeline = Arc::clone(&state.pipeline);
    let cameras = blocking(move || Ok(pipeline.probe_cameras(max_cameras))).await?;

    Ok(HttpResponse::Ok().json(json!({
        "device": state.pipeline.device_name(),
        "cameras": cameras
    })))
}

/// Open the camera (and microphone, if any) and start the worker threads.
pub async fn start_pipeline(
    state: web::Data<AppState>,
    body: Option<web::Json<StartRequest>>,
) -> AppResult<HttpResponse> {
    let camera_index = body.map(|b| b.camera_index).unwrap_or_default();
    let config = state.get_config();
    let pipeline = Arc::clone(&state.pipeline);

    let started = blocking(move || Ok(pipeline.start(camera_index, &config)?)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "started",
        "pipeline": started
    })))
}

pub async fn stop_pipeline(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let pipeline = Arc::clone(&state.pipeline);
    let stopped = blocking(move || Ok(pipeline.stop())).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": if stopped { "stopped" } else { "not_running" }
    })))
}

/// Back to RUBBING. Waits for a frame in progress, so it runs off the executor.
pub async fn reset_pipeline(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let pipeline = Arc::clone(&state.pipeline);
    let status = blocking(move || Ok(pipeline.reset())).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "reset",
        "result": status
    })))
}

/// Latest published result, or `null` before the first one.
pub async fn latest_frame(state: web::Data<AppState>) -> HttpResponse {
    let latest = state.pipeline.latest();
    HttpResponse::Ok().json(latest.as_ref().map(|frame| &frame.encoded.result))
}

/// `multipart/x-mixed-replace` stream of annotated pipeline frames.
///
/// Each new result is sent once; the stream polls for the next one every ~33 ms.
pub async fn mjpeg_stream(state: web::Data<AppState>) -> HttpResponse {
    let pipeline = Arc::clone(&state.pipeline);

    let frames = stream::unfold((pipeline, None::<u64>), |(pipeline, last_sent)| async move {
        loop {
            tokio::time::sleep(MJPEG_POLL_INTERVAL).await;
            let Some(frame) = pipeline.latest() else {
                continue;
            };
            if last_sent == Some(frame.sequence) {
                continue;
            }

            let part = mjpeg_part(&frame.encoded.jpeg);
            return Some((Ok::<_, actix_web::Error>(part), (pipeline, Some(frame.sequence))));
        }
    });

    HttpResponse::Ok()
        .content_type(format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY))
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(frames)
}

fn mjpeg_part(jpeg: &[u8]) -> web::Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    web::Bytes::from(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test as actix_test, App};
    use std::time::Instant;

    macro_rules! app {
        ($state:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .service(web::scope("/api/v1").configure(handlers::routes)),
            )
            .await
        };
    }

    #[test]
    fn test_mjpeg_part_framing() {
        let part = mjpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[actix_web::test]
    async fn test_cameras_and_bad_start() {
        let app = app!(test_state(AppConfig::default()));

        let req = actix_test::TestRequest::get().uri("/api/v1/purity/cameras").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        let cameras = body["cameras"].as_array().cloned().unwrap_or_default();
        assert_eq!(cameras.len(), 5);
        assert_eq!(cameras[0]["available"], true);
        assert_eq!(cameras[1]["available"], false);

        let req = actix_test::TestRequest::post()
            .uri("/api/v1/purity/start")
            .set_json(json!({ "cameraIndex": 3 }))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_start_frame_stop() {
        let state = test_state(AppConfig::default());
        let app = app!(state.clone());

        let req = actix_test::TestRequest::get().uri("/api/v1/purity/frame").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert!(body.is_null());

        let req = actix_test::TestRequest::post()
            .uri("/api/v1/purity/start")
            .set_json(json!({ "cameraIndex": 0 }))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = actix_test::TestRequest::post().uri("/api/v1/purity/start").to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let deadline = Instant::now() + Duration::from_secs(5);
        while state.pipeline.latest().is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let req = actix_test::TestRequest::get().uri("/api/v1/purity/frame").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert!(body["frame"].is_string());
        assert_eq!(body["status"]["task"], "rubbing");

        let req = actix_test::TestRequest::post().uri("/api/v1/purity/stop").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "stopped");

        let req = actix_test::TestRequest::get().uri("/api/v1/purity/status").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["running"], false);
    }
}

//! # Session REST API
//!
//! Purity sessions driven by client-supplied frames and audio rather than a
//! local camera. Each session owns its own stage machine, so several items
//! can be tested in parallel.
//!
//! ## Endpoints:
//! - `POST /sessions` - create (`{sessionId?, itemIndex?}`)
//! - `GET /sessions/{id}` - summary and status
//! - `POST /sessions/{id}/reset` - back to RUBBING
//! - `PUT /sessions/{id}/item` - switch item (`{itemIndex}`)
//! - `DELETE /sessions/{id}` - remove
//! - `POST /sessions/{id}/frame` - multipart `frame` image or JSON `{data}`
//! - `POST /sessions/{id}/audio` - PCM16 LE body (`?sampleRate=&channels=`) or `audio/wav`

use crate::audio::processor::PcmFormat;
use crate::error::{AppError, AppResult};
use crate::handlers::upload::{blocking, is_multipart, read_body, read_multipart_field};
use crate::state::AppState;
use crate::vision::codec::{decode_base64_frame, decode_frame};
use actix_multipart::Multipart;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::PoisonError;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: Option<String>,
    pub item_index: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRequest {
    pub item_index: u32,
}

/// JSON frame upload. `data` may be plain base64 or a `data:` URL.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRequest {
    pub data: String,
    pub item_index: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioQuery {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

pub async fn create_session(
    state: web::Data<AppState>,
    body: Option<web::Json<CreateSessionRequest>>,
) -> AppResult<HttpResponse> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let config = state.get_config();
    let (session_id, session) = state
        .sessions
        .create_session(request.session_id, request.item_index, &config)?;

    let summary = blocking(move || Ok(session.lock().unwrap_or_else(PoisonError::into_inner).summary())).await?;
    Ok(HttpResponse::Created().json(json!({
        "sessionId": session_id,
        "session": summary
    })))
}

// Session locks are held for a whole frame while one is processing, so every
// handler below takes them on a blocking thread.

pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session = state.sessions.get_session(&path)?;
    let summary = blocking(move || Ok(session.lock().unwrap_or_else(PoisonError::into_inner).summary())).await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn reset_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session = state.sessions.get_session(&path)?;
    let body = blocking(move || {
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        session.reset();
        Ok(json!({
            "sessionId": session.id(),
            "status": session.status()
        }))
    })
    .await?;
    Ok(HttpResponse::Ok().json(body))
}

pub async fn set_item(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ItemRequest>,
) -> AppResult<HttpResponse> {
    let session = state.sessions.get_session(&path)?;
    let item_index = body.item_index;
    let body = blocking(move || {
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = session.set_item_index(item_index);
        Ok(json!({
            "sessionId": session.id(),
            "changed": changed,
            "status": session.status()
        }))
    })
    .await?;
    Ok(HttpResponse::Ok().json(body))
}

pub async fn delete_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    state.sessions.remove_session(&path)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "deleted",
        "sessionId": path.into_inner()
    })))
}

/// Decode one frame, run it through the session and return the annotated result.
pub async fn submit_frame(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Payload,
) -> AppResult<HttpResponse> {
    let session = state.sessions.get_session(&path)?;

    let (upload, item_index) = if is_multipart(&req) {
        let bytes = read_multipart_field(Multipart::new(req.headers(), payload), "frame").await?;
        (FrameUpload::Raw(bytes), None)
    } else {
        let body = read_body(payload).await?;
        let request: FrameRequest = serde_json::from_slice(&body)?;
        (FrameUpload::Base64(request.data), request.item_index)
    };

    let result = blocking(move || {
        let frame = match upload {
            FrameUpload::Raw(bytes) => decode_frame(&bytes)?,
            FrameUpload::Base64(data) => decode_base64_frame(&data)?,
        };

        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = item_index {
            session.set_item_index(index);
        }
        Ok(session.process_frame_encoded(frame)?.result)
    })
    .await?;

    debug!(session_id = %path, processed = result.processed, stage = %result.status.task, "Frame processed");
    Ok(HttpResponse::Ok().json(result))
}

enum FrameUpload {
    Raw(Vec<u8>),
    Base64(String),
}

/// Feed an audio chunk into the session's sliding-window classifier.
///
/// `audio/wav` bodies carry their own format; anything else is raw PCM16 LE
/// described by the query string, defaulting to the model rate and mono.
pub async fn submit_audio(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<AudioQuery>,
    payload: web::Payload,
) -> AppResult<HttpResponse> {
    let session = state.sessions.get_session(&path)?;
    let body = read_body(payload).await?;
    if body.is_empty() {
        return Err(AppError::BadRequest("Audio body is empty".to_string()));
    }

    let is_wav = matches!(req.content_type(), "audio/wav" | "audio/x-wav" | "audio/wave");
    let format = PcmFormat::new(
        query.sample_rate.unwrap_or_else(|| state.get_config().audio.sample_rate),
        query.channels.unwrap_or(1),
    );

    let update = blocking(move || {
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        let update = if is_wav {
            session.feed_wav(&body)?
        } else {
            session.feed_pcm16(&body, format)?
        };
        Ok(update)
    })
    .await?;

    Ok(HttpResponse::Ok().json(update))
}

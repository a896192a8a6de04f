//! Request body helpers shared by the upload endpoints.

use crate::error::{AppError, AppResult};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpMessage, HttpRequest};
use futures_util::stream::StreamExt;

/// Largest accepted upload (frame image or audio clip).
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn is_multipart(req: &HttpRequest) -> bool {
    req.content_type().starts_with("multipart/form-data")
}

/// Read the bytes of the multipart field called `name`. Other fields are skipped.
pub async fn read_multipart_field(mut payload: Multipart, name: &str) -> AppResult<Vec<u8>> {
    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let field_name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
            if field_name == name {
                bytes.extend_from_slice(&chunk);
                check_size(bytes.len())?;
            }
        }

        if field_name == name {
            return Ok(bytes);
        }
    }

    Err(AppError::ValidationError(format!("No '{}' field provided", name)))
}

/// Collect a raw request body with the upload size cap.
pub async fn read_body(mut payload: web::Payload) -> AppResult<web::BytesMut> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Payload error: {}", e)))?;
        body.extend_from_slice(&chunk);
        check_size(body.len())?;
    }
    Ok(body)
}

fn check_size(len: usize) -> AppResult<()> {
    if len > MAX_UPLOAD_BYTES {
        return Err(AppError::ValidationError(format!(
            "Upload too large: more than {} bytes",
            MAX_UPLOAD_BYTES
        )));
    }
    Ok(())
}

/// Run CPU-bound work on the blocking pool.
pub async fn blocking<F, T>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    web::block(work)
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
}

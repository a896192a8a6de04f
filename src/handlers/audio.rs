use crate::audio::processor::{decode_wav, downmix_to_mono, AudioFeatures};
use crate::error::AppResult;
use crate::handlers::upload::{blocking, read_multipart_field};
use actix_multipart::Multipart;
use actix_web::HttpResponse;
use serde_json::json;

/// Decode an uploaded WAV clip (multipart field `audio`) and report its features.
///
/// Nothing is fed to a session; this is for checking microphone levels and
/// recordings before a test.
pub async fn analyze_audio(payload: Multipart) -> AppResult<HttpResponse> {
    let bytes = read_multipart_field(payload, "audio").await?;
    let size_bytes = bytes.len();

    let (format, features) = blocking(move || {
        let (format, interleaved) = decode_wav(&bytes)?;
        let mono = downmix_to_mono(&interleaved, format.channels);
        Ok((format, AudioFeatures::extract(&mono, format.sample_rate)))
    })
    .await?;

    Ok(HttpResponse::Ok().json(json!({
        "format": {
            "sampleRate": format.sample_rate,
            "channels": format.channels,
            "sizeBytes": size_bytes
        },
        "features": features,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use crate::handlers;
    use actix_web::{http::StatusCode, test, web, App};

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
        let mut cursor = std::io::Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor).unwrap();
        cursor.into_inner()
    }

    fn multipart_body(field: &str, data: &[u8]) -> (String, Vec<u8>) {
        let boundary = "touchstone-test-boundary";
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n",
            b = boundary,
            f = field
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        (format!("multipart/form-data; boundary={}", boundary), body)
    }

    #[actix_web::test]
    async fn test_analyze_wav_upload() {
        let app = test::init_service(App::new().service(web::scope("/api/v1").configure(handlers::routes))).await;

        let samples: Vec<i16> = (0..8000).map(|i| if i % 2 == 0 { 8000 } else { -8000 }).collect();
        let (content_type, body) = multipart_body("audio", &wav_bytes(&samples, 8000));
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/analyze")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["format"]["sampleRate"], 8000);
        assert_eq!(body["features"]["length"], 8000);
        assert!((body["features"]["durationSeconds"].as_f64().unwrap() - 1.0).abs() < 1e-6);
        assert!((body["features"]["zeroCrossingRate"].as_f64().unwrap() - 1.0).abs() < 1e-6);
    }

    #[actix_web::test]
    async fn test_missing_audio_field() {
        let app = test::init_service(App::new().service(web::scope("/api/v1").configure(handlers::routes))).await;
        let (content_type, body) = multipart_body("other", b"abc");
        let req = test::TestRequest::post()
            .uri("/api/v1/audio/analyze")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}

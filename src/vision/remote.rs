//! # Remote Detector Backend
//!
//! The stone, gold and acid models are served by an inference server over
//! HTTP. [`HttpDetector`] implements [`Detector`] against it: every call
//! posts one JPEG frame and gets back boxes, masks and class names.
//!
//! ## Wire Format:
//! - `POST {base}/predict/{model}` with `{"image": "<base64 jpeg>", "confidence": 0.5, "iou": 0.5}`
//! - reply `{"boxes": [{"x1", "y1", "x2", "y2", "confidence", "classId"}], "masks": [{"width", "height", "values"}], "names": {"0": "acid_22k"}}`
//! - `404` means the server does not host that model
//!
//! Calls block. They run on the per-model worker threads of
//! [`TimedDetector`](crate::vision::detector::TimedDetector) or on the
//! pipeline's own threads, never on an async executor.

use crate::vision::codec::encode_base64_jpeg;
use crate::vision::detector::{DetectParams, DetectionBox, DetectionError, Detections, Detector};
use crate::vision::geometry::RawMask;
use image::RgbImage;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Serialize)]
struct PredictRequest {
    image: String,
    confidence: f32,
    iou: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    class_id: u32,
}

#[derive(Debug, Deserialize)]
struct WireMask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PredictResponse {
    boxes: Vec<WireBox>,
    masks: Vec<WireMask>,
    names: HashMap<u32, String>,
}

impl PredictResponse {
    fn into_detections(self, model: &str) -> Result<(Detections, HashMap<u32, String>), DetectionError> {
        let boxes = self
            .boxes
            .into_iter()
            .map(|b| DetectionBox {
                x1: b.x1,
                y1: b.y1,
                x2: b.x2,
                y2: b.y2,
                confidence: b.confidence,
                class_id: b.class_id,
            })
            .collect();

        let masks = self
            .masks
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                let (width, height, len) = (m.width, m.height, m.values.len());
                RawMask::new(width, height, m.values).ok_or_else(|| DetectionError::InvalidOutput {
                    model: model.to_string(),
                    message: format!("mask {} has {} values for {}x{}", i, len, width, height),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((Detections { boxes, masks }, self.names))
    }
}

/// Detector backed by an HTTP inference server.
pub struct HttpDetector {
    client: Client,
    base_url: String,
    /// Models this backend answers for.
    models: Vec<String>,
    timeout_ms: u64,
    /// Class names seen in replies, per model.
    names: RwLock<HashMap<String, HashMap<u32, String>>>,
}

impl HttpDetector {
    /// Build a client for `base_url`. The request timeout should match the
    /// model call timeout so a stalled server frees the worker thread.
    ///
    /// Constructing the blocking client must happen off the async runtime.
    pub fn new(base_url: &str, models: Vec<String>, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().user_agent(concat!("touchstone-backend/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
            names: RwLock::new(HashMap::new()),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/predict/{}", self.base_url, model)
    }

    fn request_error(&self, model: &str, err: reqwest::Error) -> DetectionError {
        if err.is_timeout() {
            DetectionError::Timeout {
                model: model.to_string(),
                timeout_ms: self.timeout_ms,
            }
        } else if err.is_connect() {
            DetectionError::ModelUnavailable(model.to_string())
        } else {
            DetectionError::Inference {
                model: model.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl Detector for HttpDetector {
    fn predict(&self, model: &str, image: &RgbImage, params: DetectParams) -> Result<Detections, DetectionError> {
        if !self.models.iter().any(|m| m == model) {
            return Err(DetectionError::ModelUnavailable(model.to_string()));
        }

        let image = encode_base64_jpeg(image, JPEG_QUALITY).map_err(|e| DetectionError::Inference {
            model: model.to_string(),
            message: e.to_string(),
        })?;
        let request = PredictRequest {
            image,
            confidence: params.confidence,
            iou: params.iou,
        };

        let response = self
            .client
            .post(self.endpoint(model))
            .json(&request)
            .send()
            .map_err(|e| self.request_error(model, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(DetectionError::ModelUnavailable(model.to_string())),
            status if !status.is_success() => {
                return Err(DetectionError::Inference {
                    model: model.to_string(),
                    message: format!("server returned {}", status),
                })
            }
            _ => {}
        }

        let body: PredictResponse = response.json().map_err(|e| DetectionError::InvalidOutput {
            model: model.to_string(),
            message: e.to_string(),
        })?;
        let (detections, names) = body.into_detections(model)?;
        debug!(model, boxes = detections.boxes.len(), masks = detections.masks.len(), "Remote prediction");

        if !names.is_empty() {
            self.names
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(model.to_string())
                .or_default()
                .extend(names);
        }
        Ok(detections)
    }

    fn class_name(&self, model: &str, class_id: u32) -> Option<String> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .and_then(|names| names.get(&class_id))
            .cloned()
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const REPLY: &str = r#"{
        "boxes": [{"x1": 10, "y1": 20, "x2": 110, "y2": 70, "confidence": 0.91, "classId": 2}],
        "masks": [{"width": 2, "height": 2, "values": [0.9, 0.1, 0.4, 0.8]}],
        "names": {"2": "acid_22k"}
    }"#;

    /// Answers `replies.len()` requests in order and hands back each request path and body.
    fn serve(replies: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<(String, String)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);

                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let path = request_line.split_whitespace().nth(1).unwrap_or_default().to_string();

                let mut content_length = 0;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).unwrap();
                seen.push((path, String::from_utf8(request_body).unwrap()));

                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .unwrap();
            }
            seen
        });
        (url, handle)
    }

    fn models() -> Vec<String> {
        vec!["stone".to_string(), "acid".to_string()]
    }

    fn params() -> DetectParams {
        DetectParams {
            confidence: 0.4,
            iou: 0.5,
        }
    }

    #[test]
    fn test_reply_parsing() {
        let body: PredictResponse = serde_json::from_str(REPLY).unwrap();
        let (detections, names) = body.into_detections("acid").unwrap();

        assert_eq!(detections.boxes.len(), 1);
        assert_eq!(detections.boxes[0].class_id, 2);
        assert_eq!(detections.boxes[0].bbox().width(), 100);
        assert_eq!(detections.masks[0].binarize(0.5).count(), 2);
        assert_eq!(names.get(&2).map(String::as_str), Some("acid_22k"));

        let empty: PredictResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.into_detections("acid").unwrap().0.is_empty());
    }

    #[test]
    fn test_mask_size_mismatch_is_invalid_output() {
        let body: PredictResponse =
            serde_json::from_str(r#"{"masks": [{"width": 3, "height": 3, "values": [0.5]}]}"#).unwrap();
        assert!(matches!(
            body.into_detections("stone"),
            Err(DetectionError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn test_predict_posts_frame_and_caches_names() {
        let (url, server) = serve(vec![(200, REPLY), (404, "{}")]);
        let detector = HttpDetector::new(&format!("{}/", url), models(), Some(Duration::from_secs(5))).unwrap();
        let image = RgbImage::new(32, 24);

        let detections = detector.predict("acid", &image, params()).unwrap();
        assert_eq!(detections.boxes.len(), 1);
        assert_eq!(detector.class_name("acid", 2).as_deref(), Some("acid_22k"));
        assert_eq!(detector.class_name("stone", 2), None);

        assert!(matches!(
            detector.predict("stone", &image, params()),
            Err(DetectionError::ModelUnavailable(m)) if m == "stone"
        ));

        let seen = server.join().unwrap();
        assert_eq!(seen[0].0, "/predict/acid");
        assert_eq!(seen[1].0, "/predict/stone");
        let request: serde_json::Value = serde_json::from_str(&seen[0].1).unwrap();
        assert!((request["confidence"].as_f64().unwrap() - 0.4).abs() < 1e-6);
        assert!(!request["image"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_server_error_and_bad_json() {
        let (url, server) = serve(vec![(500, "{}"), (200, "not json")]);
        let detector = HttpDetector::new(&url, models(), Some(Duration::from_secs(5))).unwrap();
        let image = RgbImage::new(8, 8);

        assert!(matches!(
            detector.predict("stone", &image, params()),
            Err(DetectionError::Inference { .. })
        ));
        assert!(matches!(
            detector.predict("stone", &image, params()),
            Err(DetectionError::InvalidOutput { .. })
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_unknown_model_and_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let detector = HttpDetector::new(&url, models(), Some(Duration::from_secs(2))).unwrap();
        let image = RgbImage::new(8, 8);

        assert!(matches!(
            detector.predict("gold", &image, params()),
            Err(DetectionError::ModelUnavailable(_))
        ));
        assert!(matches!(
            detector.predict("stone", &image, params()),
            Err(DetectionError::ModelUnavailable(_))
        ));
        assert_eq!(detector.models(), models());
    }
}

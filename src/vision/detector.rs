//! # Detector Capability
//!
//! Object detection and segmentation models are opaque collaborators. The
//! service only relies on the [`Detector`] trait: given a model name, an
//! image and thresholds, return boxes and masks.
//!
//! ## Key Types:
//! - **Detections**: boxes `(x1, y1, x2, y2, confidence, class_id)` plus segmentation masks
//! - **ModelRegistry**: routes a model name to the detector registered for it
//! - **TimedDetector**: runs each model on its own worker thread and bounds every call
//!
//! Failures are returned as [`DetectionError`]; callers decide the fallback
//! (the rubbing and acid stages treat any failure as "nothing detected").

use crate::guard::{BoundedWorker, GuardError};
use crate::vision::geometry::{BBox, RawMask};
use image::RgbImage;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("model '{model}' failed: {message}")]
    Inference { model: String, message: String },

    #[error("model '{model}' did not answer within {timeout_ms} ms")]
    Timeout { model: String, timeout_ms: u64 },

    #[error("model '{model}' returned invalid output: {message}")]
    InvalidOutput { model: String, message: String },
}

/// Thresholds passed with every detector call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Minimum box confidence the model should return
    pub confidence: f32,
    /// Non-maximum suppression overlap threshold
    pub iou: f32,
}

/// One detected object in the coordinates of the image passed in.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// Model-specific class; see [`Detector::class_name`]
    pub class_id: u32,
}

impl DetectionBox {
    pub fn bbox(&self) -> BBox {
        BBox::from_f32(self.x1, self.y1, self.x2, self.y2)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Everything one model call returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    pub boxes: Vec<DetectionBox>,
    /// Segmentation masks; the first one is the model's best
    pub masks: Vec<RawMask>,
}

impl Detections {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty() && self.masks.is_empty()
    }

    /// Box with the largest area; ties keep the first.
    pub fn largest_box(&self) -> Option<&DetectionBox> {
        self.boxes.iter().fold(None, |best: Option<&DetectionBox>, candidate| match best {
            Some(current) if current.area() >= candidate.area() => Some(current),
            _ => Some(candidate),
        })
    }
}

/// A set of named detection models. Implementations may block; callers
/// run them off the async executor.
pub trait Detector: Send + Sync {
    fn predict(&self, model: &str, image: &RgbImage, params: DetectParams) -> Result<Detections, DetectionError>;

    /// Human-readable label for a class id, if the model has one.
    fn class_name(&self, _model: &str, _class_id: u32) -> Option<String> {
        None
    }

    /// Names this detector answers to.
    fn models(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Name-routed collection of detectors.
///
/// Built once at startup and shared by every session. An empty registry
/// is valid: every call fails with [`DetectionError::ModelUnavailable`].
#[derive(Default, Clone)]
pub struct ModelRegistry {
    detectors: BTreeMap<String, Arc<dyn Detector>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: impl Into<String>, detector: Arc<dyn Detector>) {
        self.detectors.insert(model.into(), detector);
    }

    pub fn with(mut self, model: impl Into<String>, detector: Arc<dyn Detector>) -> Self {
        self.register(model, detector);
        self
    }
}

impl Detector for ModelRegistry {
    fn predict(&self, model: &str, image: &RgbImage, params: DetectParams) -> Result<Detections, DetectionError> {
        let detector = self
            .detectors
            .get(model)
            .ok_or_else(|| DetectionError::ModelUnavailable(model.to_string()))?;
        detector.predict(model, image, params)
    }

    fn class_name(&self, model: &str, class_id: u32) -> Option<String> {
        self.detectors.get(model)?.class_name(model, class_id)
    }

    fn models(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }
}

/// Wraps a detector so no single call can stall the caller past `timeout`.
///
/// Each model name gets one [`BoundedWorker`], started on first use. While a
/// model has a call running past its deadline, further calls to it fail
/// with [`DetectionError::ModelUnavailable`] until that call returns.
pub struct TimedDetector {
    inner: Arc<dyn Detector>,
    timeout: Option<Duration>,
    workers: Mutex<HashMap<String, BoundedWorker>>,
}

impl TimedDetector {
    pub fn new(inner: Arc<dyn Detector>, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn worker(&self, model: &str) -> Result<BoundedWorker, GuardError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = workers.get(model) {
            return Ok(worker.clone());
        }
        let worker = BoundedWorker::spawn(model)?;
        workers.insert(model.to_string(), worker.clone());
        Ok(worker)
    }
}

impl Detector for TimedDetector {
    fn predict(&self, model: &str, image: &RgbImage, params: DetectParams) -> Result<Detections, DetectionError> {
        let Some(limit) = self.timeout else {
            return self.inner.predict(model, image, params);
        };

        let inner = Arc::clone(&self.inner);
        let owned_model = model.to_string();
        let owned_image = image.clone();
        let result = self.worker(model).and_then(|worker| {
            worker.call(Some(limit), move || inner.predict(&owned_model, &owned_image, params))
        });

        match result {
            Ok(detections) => detections,
            Err(GuardError::TimedOut(_)) => Err(DetectionError::Timeout {
                model: model.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
            Err(GuardError::Busy) => Err(DetectionError::ModelUnavailable(model.to_string())),
            Err(other) => Err(DetectionError::Inference {
                model: model.to_string(),
                message: other.to_string(),
            }),
        }
    }

    fn class_name(&self, model: &str, class_id: u32) -> Option<String> {
        self.inner.class_name(model, class_id)
    }

    fn models(&self) -> Vec<String> {
        self.inner.models()
    }
}

/// Snapshot of detector availability for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorStatus {
    /// Every model name the registry answers to, sorted
    pub registered: Vec<String>,
    pub stone_available: bool,
    pub gold_available: bool,
    pub acid_available: bool,
}

impl DetectorStatus {
    pub fn from_models(registered: Vec<String>, stone: &str, gold: &str, acid: &str) -> Self {
        let has = |name: &str| registered.iter().any(|m| m == name);
        Self {
            stone_available: has(stone),
            gold_available: has(gold),
            acid_available: has(acid),
            registered,
        }
    }
}

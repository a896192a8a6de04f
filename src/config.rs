//! # Configuration Management
//!
//! Loads the service configuration from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform conventions)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_VISION__MASK_TTL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! ## Sections:
//! - **server**: bind address
//! - **models**: detector model names and thresholds, classifier weights
//! - **audio**: sliding-window classifier parameters
//! - **vision**: rubbing-motion analysis parameters
//! - **pipeline**: capture/process worker tuning and the replay device source
//! - **performance**: session limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete service configuration.
///
/// Every section carries `#[serde(default)]` so a partial `config.toml`
/// only has to mention the values it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub vision: VisionConfig,
    pub pipeline: PipelineConfig,
    pub performance: PerformanceConfig,
}

/// Server bind settings.
///
/// - `host = "127.0.0.1"`: only local clients (development)
/// - `host = "0.0.0.0"`: any interface (production)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Detector and classifier settings.
///
/// ## Fields:
/// - `stone_model` / `gold_model` / `acid_model`: names the detector registry routes on
/// - `detect_confidence` / `iou`: thresholds passed on every detector call
/// - `acid_confidence`: the stricter threshold an acid detection must reach
/// - `call_timeout_ms`: upper bound on a single model call, 0 waits forever
/// - `detector_url`: base URL of the inference server hosting the detection models; required at startup
/// - `classifier_weights`: safetensors file for the audio classifier, empty disables audio gating
/// - `compute_device`: "auto", "cpu", "cuda" or "metal" for the classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    pub stone_model: String,
    pub gold_model: String,
    pub acid_model: String,
    pub detect_confidence: f32,
    pub iou: f32,
    pub acid_confidence: f32,
    pub call_timeout_ms: u64,
    pub detector_url: String,
    pub classifier_weights: String,
    pub compute_device: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            stone_model: "stone".to_string(),
            gold_model: "gold".to_string(),
            acid_model: "acid".to_string(),
            detect_confidence: 0.5,
            iou: 0.5,
            acid_confidence: 0.8,
            call_timeout_ms: 2000,
            detector_url: String::new(),
            classifier_weights: String::new(),
            compute_device: "auto".to_string(),
        }
    }
}

impl ModelsConfig {
    /// `None` when no timeout should be applied.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    pub fn detector_url(&self) -> Option<&str> {
        let trimmed = self.detector_url.trim().trim_end_matches('/');
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Model names in stone, gold, acid order, without repeats.
    pub fn detector_models(&self) -> Vec<String> {
        let mut models: Vec<String> = Vec::with_capacity(3);
        for name in [&self.stone_model, &self.gold_model, &self.acid_model] {
            if !models.contains(name) {
                models.push(name.clone());
            }
        }
        models
    }

    pub fn classifier_weights_path(&self) -> Option<PathBuf> {
        let trimmed = self.classifier_weights.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}

/// Audio sliding-window classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub window_seconds: f32,
    pub hop_ratio: f32,
    pub confidence_threshold: f32,
    pub buffer_seconds: u32,
    pub silence_rms: f32,
}

/// The smallest window the classifier is ever run on.
pub const MIN_WINDOW_SAMPLES: usize = 8000;

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            window_seconds: 2.0,
            hop_ratio: 0.1,
            confidence_threshold: 0.75,
            buffer_seconds: 30,
            silence_rms: 0.005,
        }
    }
}

impl AudioConfig {
    /// Samples per inference window, never below [`MIN_WINDOW_SAMPLES`].
    pub fn window_samples(&self) -> usize {
        let derived = (self.sample_rate as f32 * self.window_seconds) as usize;
        derived.max(MIN_WINDOW_SAMPLES)
    }

    /// Samples the window advances after each inference, at least one.
    pub fn hop_samples(&self) -> usize {
        ((self.window_samples() as f32 * self.hop_ratio) as usize).max(1)
    }

    /// Ring buffer capacity, always large enough for one window.
    pub fn buffer_samples(&self) -> usize {
        (self.sample_rate as usize * self.buffer_seconds as usize).max(self.window_samples())
    }
}

/// Rubbing-motion analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisionConfig {
    pub fluctuation_threshold: f32,
    pub min_flips: usize,
    pub history_capacity: usize,
    pub mask_ttl: u32,
    pub mask_threshold: f32,
    pub smoothing_alpha: f32,
    pub jitter_gate_px: f32,
    pub visual_confirm_frames: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            fluctuation_threshold: 2.5,
            min_flips: 2,
            history_capacity: 30,
            mask_ttl: 2,
            mask_threshold: 0.5,
            smoothing_alpha: 0.3,
            jitter_gate_px: 10.0,
            visual_confirm_frames: 3,
        }
    }
}

/// Capture/process pipeline tuning.
///
/// ## Fields:
/// - `frame_queue_capacity` / `result_queue_capacity`: bounded drop-oldest queues
/// - `process_interval`: only every Nth captured frame runs the detectors
/// - `queue_timeout_ms`: how long the process loop waits for a frame before rechecking the running flag
/// - `join_timeout_ms`: how long `stop()` waits for each worker thread
/// - `replay_dir`: directory the replay device source reads from, empty means no devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    pub process_interval: u32,
    pub queue_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub jpeg_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub max_cameras: u32,
    pub replay_dir: String,
    pub replay_fps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 3,
            result_queue_capacity: 3,
            process_interval: 3,
            queue_timeout_ms: 100,
            join_timeout_ms: 1000,
            jpeg_quality: 75,
            max_width: 640,
            max_height: 480,
            max_cameras: 5,
            replay_dir: String::new(),
            replay_fps: 30,
        }
    }
}

impl PipelineConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn replay_dir_path(&self) -> Option<&Path> {
        let trimmed = self.replay_dir.trim();
        (!trimmed.is_empty()).then(|| Path::new(trimmed))
    }
}

/// Session limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub session_max_age_seconds: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            session_max_age_seconds: 3600,
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_PIPELINE__REPLAY_DIR=/data/replay`
    /// - `APP_MODELS__CLASSIFIER_WEIGHTS=/models/wave_cnn.safetensors`
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave rather than fail loudly.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        for (name, value) in [
            ("models.detect_confidence", self.models.detect_confidence),
            ("models.iou", self.models.iou),
            ("models.acid_confidence", self.models.acid_confidence),
            ("audio.confidence_threshold", self.audio.confidence_threshold),
            ("vision.mask_threshold", self.vision.mask_threshold),
            ("vision.smoothing_alpha", self.vision.smoothing_alpha),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }

        if let Some(url) = self.models.detector_url() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!("models.detector_url must be an http(s) URL, got {}", url));
            }
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.window_seconds <= 0.0 {
            return Err(anyhow::anyhow!("Audio window must be longer than 0 seconds"));
        }

        if self.audio.hop_ratio <= 0.0 || self.audio.hop_ratio > 1.0 {
            return Err(anyhow::anyhow!("Audio hop ratio must be within (0, 1]"));
        }

        if self.vision.history_capacity < 3 {
            return Err(anyhow::anyhow!("Distance history must hold at least 3 samples"));
        }

        if self.pipeline.frame_queue_capacity == 0 || self.pipeline.result_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Pipeline queue capacities must be greater than 0"));
        }

        if self.pipeline.process_interval == 0 {
            return Err(anyhow::anyhow!("Process interval must be at least 1"));
        }

        if self.pipeline.jpeg_quality == 0 || self.pipeline.jpeg_quality > 100 {
            return Err(anyhow::anyhow!("JPEG quality must be within 1..=100"));
        }

        if self.pipeline.max_width == 0 || self.pipeline.max_height == 0 {
            return Err(anyhow::anyhow!("Output frame size must be non-zero"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used for runtime config updates).
    ///
    /// The update is merged key by key into the current values, so
    /// `{"vision": {"mask_ttl": 4}}` changes only that one field. The result
    /// is validated before it replaces `self`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

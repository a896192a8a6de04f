//! # Rubbing-Sound Classifier
//!
//! The [`Classifier`] capability maps a fixed-length, normalized waveform
//! to a two-class probability vector (index 0 = OK, index 1 = NOT OK).
//! [`WaveCnnClassifier`] is the production implementation: a raw-waveform
//! 1-D CNN evaluated with candle and loaded from a safetensors file.
//!
//! ## Network layout (weight prefixes in brackets):
//! 1. Conv1d 1→32, kernel 80, stride 4, padding 40 (`net.0`), ReLU, MaxPool 4
//! 2. Conv1d 32→64, kernel 5, padding 2 (`net.3`), ReLU, MaxPool 4
//! 3. Conv1d 64→128, kernel 5, padding 2 (`net.6`), ReLU, MaxPool 4
//! 4. Conv1d 128→256, kernel 5, padding 2 (`net.9`), ReLU, MaxPool 4
//! 5. Global average pool over time, Linear 256→2 (`fc`), softmax

use crate::guard::{BoundedWorker, GuardError};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to load classifier: {0}")]
    Load(String),

    #[error("classifier inference failed: {0}")]
    Inference(String),

    #[error("classifier returned {0} probabilities, expected 2")]
    InvalidOutput(usize),

    #[error("classifier call exceeded {0} ms")]
    Timeout(u64),

    #[error("classifier is unavailable: {0}")]
    Unavailable(String),
}

impl From<candle_core::Error> for ClassifierError {
    fn from(err: candle_core::Error) -> Self {
        ClassifierError::Inference(err.to_string())
    }
}

/// Two-way label produced by the audio model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioLabel {
    Ok,
    NotOk,
}

impl AudioLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioLabel::Ok => "OK",
            AudioLabel::NotOk => "NOT_OK",
        }
    }
}

/// One classifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPrediction {
    pub label: AudioLabel,
    pub confidence: f32,
    pub probabilities: [f32; 2],
}

impl AudioPrediction {
    /// Argmax over a two-class probability vector.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, ClassifierError> {
        let [ok, not_ok] = <[f32; 2]>::try_from(probabilities)
            .map_err(|_| ClassifierError::InvalidOutput(probabilities.len()))?;

        let (label, confidence) = if ok >= not_ok {
            (AudioLabel::Ok, ok)
        } else {
            (AudioLabel::NotOk, not_ok)
        };

        Ok(Self {
            label,
            confidence,
            probabilities: [ok, not_ok],
        })
    }

    /// OK with at least `threshold` confidence.
    pub fn qualifies(&self, threshold: f32) -> bool {
        self.label == AudioLabel::Ok && self.confidence >= threshold
    }
}

/// Waveform classifier capability.
///
/// Implementations receive an already normalized window and return one
/// probability per class.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, window: &[f32]) -> Result<Vec<f32>, ClassifierError>;
}

/// Where candle should run the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            other => Err(format!("Unknown device preference: {}", other)),
        }
    }
}

static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Resolve a preference to a device, falling back to CPU.
pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0).unwrap_or(Device::Cpu),
        DevicePreference::Metal => Device::new_metal(0).unwrap_or(Device::Cpu),
        DevicePreference::Auto => BEST_DEVICE
            .get_or_init(|| {
                if let Ok(device) = Device::new_cuda(0) {
                    info!("Selected CUDA GPU for audio inference");
                    return device;
                }
                if let Ok(device) = Device::new_metal(0) {
                    info!("Selected Metal GPU for audio inference");
                    return device;
                }
                info!("Using CPU for audio inference");
                Device::Cpu
            })
            .clone(),
    }
}

struct WaveCnn1d {
    convs: Vec<Conv1d>,
    fc: Linear,
}

impl WaveCnn1d {
    fn load(vb: VarBuilder) -> candle_core::Result<Self> {
        let stem = Conv1dConfig {
            padding: 40,
            stride: 4,
            ..Default::default()
        };
        let block = Conv1dConfig {
            padding: 2,
            ..Default::default()
        };

        let convs = vec![
            candle_nn::conv1d(1, 32, 80, stem, vb.pp("net.0"))?,
            candle_nn::conv1d(32, 64, 5, block, vb.pp("net.3"))?,
            candle_nn::conv1d(64, 128, 5, block, vb.pp("net.6"))?,
            candle_nn::conv1d(128, 256, 5, block, vb.pp("net.9"))?,
        ];
        let fc = candle_nn::linear(256, 2, vb.pp("fc"))?;

        Ok(Self { convs, fc })
    }

    /// `(batch, 1, samples)` → `(batch, 2)` logits.
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = input.clone();
        for conv in &self.convs {
            x = conv.forward(&x)?.relu()?;
            x = max_pool1d(&x, 4)?;
        }
        let pooled = x.mean(D::Minus1)?;
        self.fc.forward(&pooled)
    }
}

fn max_pool1d(x: &Tensor, kernel: usize) -> candle_core::Result<Tensor> {
    x.unsqueeze(2)?.max_pool2d((1, kernel))?.squeeze(2)
}

/// Receptive field of the four pooling stages: shorter windows collapse to nothing.
const MIN_INPUT_SAMPLES: usize = 4 * 4 * 4 * 4 * 4;

/// candle-backed [`Classifier`].
pub struct WaveCnnClassifier {
    model: WaveCnn1d,
    device: Device,
    name: String,
}

impl WaveCnnClassifier {
    /// Load weights from a safetensors file.
    pub fn from_safetensors(path: &Path, preference: DevicePreference) -> Result<Self, ClassifierError> {
        if !path.exists() {
            return Err(ClassifierError::Load(format!(
                "weights file not found: {}",
                path.display()
            )));
        }

        let device = select_device(preference);
        // SAFETY: the weights file is memory-mapped read-only and not modified while loaded.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device) }
            .map_err(|e| ClassifierError::Load(e.to_string()))?;
        let model = WaveCnn1d::load(vb).map_err(|e| ClassifierError::Load(e.to_string()))?;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wave_cnn".to_string());

        info!(model = %name, device = ?device, "Loaded audio classifier");
        Ok(Self {
            model,
            device,
            name,
        })
    }
}

impl Classifier for WaveCnnClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, window: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        if window.len() < MIN_INPUT_SAMPLES {
            return Err(ClassifierError::Inference(format!(
                "window of {} samples is shorter than the {} the network needs",
                window.len(),
                MIN_INPUT_SAMPLES
            )));
        }

        let input = Tensor::from_slice(window, (1, 1, window.len()), &self.device)?;
        let logits = self.model.forward(&input)?;
        let probabilities = candle_nn::ops::softmax_last_dim(&logits)?
            .squeeze(0)?
            .to_vec1::<f32>()?;

        debug!(?probabilities, "Audio classifier output");
        Ok(probabilities)
    }
}

/// Bounds every classifier call by `timeout`, like the detector wrapper.
///
/// Calls run on a single worker thread started on first use.
pub struct TimedClassifier {
    inner: Arc<dyn Classifier>,
    timeout: Option<Duration>,
    worker: Mutex<Option<BoundedWorker>>,
}

impl TimedClassifier {
    pub fn new(inner: Arc<dyn Classifier>, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> Result<BoundedWorker, GuardError> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.clone());
        }
        let worker = BoundedWorker::spawn("classifier")?;
        *slot = Some(worker.clone());
        Ok(worker)
    }
}

impl Classifier for TimedClassifier {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn predict(&self, window: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        let Some(limit) = self.timeout else {
            return self.inner.predict(window);
        };

        let inner = Arc::clone(&self.inner);
        let owned = window.to_vec();
        match self.worker().and_then(|worker| worker.call(Some(limit), move || inner.predict(&owned))) {
            Ok(result) => result,
            Err(GuardError::TimedOut(_)) => Err(ClassifierError::Timeout(limit.as_millis() as u64)),
            Err(err @ GuardError::Busy) => Err(ClassifierError::Unavailable(err.to_string())),
            Err(other) => Err(ClassifierError::Inference(other.to_string())),
        }
    }
}

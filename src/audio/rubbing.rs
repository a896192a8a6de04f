//! Sliding-window rubbing-sound detection.
//!
//! [`AudioRubbingClassifier`] accepts audio in whatever chunk sizes the
//! device or client delivers, and runs the classifier once per hop over an
//! overlapping window. Model cadence is therefore independent of input
//! chunking: a chunk spanning several hops yields one inference per hop,
//! each over the window that ends at that hop.

use crate::audio::buffer::RingSampleBuffer;
use crate::audio::classifier::{AudioPrediction, Classifier, ClassifierError};
use crate::audio::processor::normalize_window;
use crate::config::AudioConfig;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of [`AudioRubbingClassifier::maybe_infer`].
#[derive(Debug, Clone, PartialEq)]
pub enum AudioInference {
    /// Not enough new samples since the last inference. A normal outcome.
    Insufficient { accumulated: usize, window: usize },
    /// No classifier is configured.
    Unavailable,
    Prediction(AudioPrediction),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioClassifierStatus {
    pub available: bool,
    pub sample_rate: u32,
    pub window_samples: usize,
    pub hop_samples: usize,
    pub buffered_samples: usize,
    pub accumulated_samples: usize,
    pub inference_count: u64,
    pub failure_count: u64,
    pub last_prediction: Option<AudioPrediction>,
}

pub struct AudioRubbingClassifier {
    buffer: RingSampleBuffer,
    classifier: Option<Arc<dyn Classifier>>,
    sample_rate: u32,
    window: usize,
    hop: usize,
    threshold: f32,
    inference_count: u64,
    failure_count: u64,
    last_prediction: Option<AudioPrediction>,
}

impl AudioRubbingClassifier {
    pub fn new(config: &AudioConfig, classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self {
            buffer: RingSampleBuffer::new(config.buffer_samples()),
            classifier,
            sample_rate: config.sample_rate,
            window: config.window_samples(),
            hop: config.hop_samples(),
            threshold: config.confidence_threshold,
            inference_count: 0,
            failure_count: 0,
            last_prediction: None,
        }
    }

    pub fn window_samples(&self) -> usize {
        self.window
    }

    pub fn hop_samples(&self) -> usize {
        self.hop
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_available(&self) -> bool {
        self.classifier.is_some()
    }

    /// Buffer a chunk of mono samples at the configured rate.
    pub fn feed(&mut self, chunk: &[f32]) {
        self.buffer.write(chunk);
    }

    /// Run the classifier if a full hop of new audio has arrived.
    ///
    /// The window that is due ends `accumulated - window` samples before
    /// the newest sample. It advances by one hop whether or not the model
    /// call succeeds, so a failing model is retried at the normal cadence
    /// instead of on every chunk.
    pub fn maybe_infer(&mut self) -> Result<AudioInference, ClassifierError> {
        let accumulated = self.buffer.accumulated();
        if accumulated < self.window {
            return Ok(AudioInference::Insufficient {
                accumulated,
                window: self.window,
            });
        }

        let Some(classifier) = self.classifier.clone() else {
            self.buffer.advance(self.hop);
            return Ok(AudioInference::Unavailable);
        };

        let lag = accumulated - self.window;
        let mut window = match self.buffer.read_window_at(self.window, lag) {
            Ok(window) => window,
            Err(err) => {
                // accumulated <= min(written, capacity), so this is unreachable
                warn!(error = %err, "Ring buffer refused a full window");
                self.buffer.advance(self.hop);
                return Ok(AudioInference::Insufficient {
                    accumulated,
                    window: self.window,
                });
            }
        };
        normalize_window(&mut window);

        let outcome = classifier
            .predict(&window)
            .and_then(|probabilities| AudioPrediction::from_probabilities(&probabilities));
        self.buffer.advance(self.hop);

        match outcome {
            Ok(prediction) => {
                self.inference_count += 1;
                debug!(
                    label = prediction.label.as_str(),
                    confidence = prediction.confidence,
                    count = self.inference_count,
                    "Audio inference"
                );
                self.last_prediction = Some(prediction.clone());
                Ok(AudioInference::Prediction(prediction))
            }
            Err(err) => {
                self.failure_count += 1;
                Err(err)
            }
        }
    }

    /// Feed a chunk and drain every inference it makes due.
    ///
    /// Failures are logged and skipped; the caller only sees predictions.
    pub fn feed_and_infer(&mut self, chunk: &[f32]) -> Vec<AudioPrediction> {
        self.feed(chunk);

        let mut predictions = Vec::new();
        loop {
            match self.maybe_infer() {
                Ok(AudioInference::Prediction(prediction)) => predictions.push(prediction),
                Ok(AudioInference::Unavailable) => continue,
                Ok(AudioInference::Insufficient { .. }) => break,
                Err(err) => warn!(error = %err, "Audio classifier call failed"),
            }
        }
        predictions
    }

    pub fn last_prediction(&self) -> Option<&AudioPrediction> {
        self.last_prediction.as_ref()
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
        self.inference_count = 0;
        self.failure_count = 0;
        self.last_prediction = None;
    }

    pub fn status(&self) -> AudioClassifierStatus {
        AudioClassifierStatus {
            available: self.is_available(),
            sample_rate: self.sample_rate,
            window_samples: self.window,
            hop_samples: self.hop,
            buffered_samples: self.buffer.len(),
            accumulated_samples: self.buffer.accumulated(),
            inference_count: self.inference_count,
            failure_count: self.failure_count,
            last_prediction: self.last_prediction.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns a fixed probability vector and records the windows it saw.
    pub(crate) struct FixedClassifier {
        pub probabilities: Vec<f32>,
        pub calls: AtomicUsize,
        pub windows: Mutex<Vec<Vec<f32>>>,
    }

    impl FixedClassifier {
        pub(crate) fn new(probabilities: Vec<f32>) -> Self {
            Self {
                probabilities,
                calls: AtomicUsize::new(0),
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    impl Classifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        fn predict(&self, window: &[f32]) -> Result<Vec<f32>, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.windows.lock().unwrap().push(window.to_vec());
            Ok(self.probabilities.clone())
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn name(&self) -> &str {
            "failing"
        }

        fn predict(&self, _window: &[f32]) -> Result<Vec<f32>, ClassifierError> {
            Err(ClassifierError::Inference("boom".to_string()))
        }
    }

    fn small_config() -> AudioConfig {
        // 8000-sample window, 800-sample hop
        AudioConfig {
            sample_rate: 4000,
            window_seconds: 2.0,
            hop_ratio: 0.1,
            buffer_seconds: 5,
            ..AudioConfig::default()
        }
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.05).sin() * 0.4 + 0.2).collect()
    }

    #[test]
    fn test_waits_for_full_window() {
        let model = Arc::new(FixedClassifier::new(vec![0.9, 0.1]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model.clone()));

        audio.feed(&tone(7999));
        assert_eq!(
            audio.maybe_infer().unwrap(),
            AudioInference::Insufficient {
                accumulated: 7999,
                window: 8000
            }
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        audio.feed(&tone(1));
        match audio.maybe_infer().unwrap() {
            AudioInference::Prediction(prediction) => assert!(prediction.qualifies(0.75)),
            other => panic!("expected prediction, got {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_windows_follow_hop() {
        let model = Arc::new(FixedClassifier::new(vec![0.2, 0.8]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model.clone()));

        // One window plus three hops, delivered in odd-sized chunks.
        let total = 8000 + 3 * 800;
        let mut predictions = Vec::new();
        for chunk in tone(total).chunks(333) {
            predictions.extend(audio.feed_and_infer(chunk));
        }

        assert_eq!(predictions.len(), 4);
        assert!(predictions.iter().all(|p| p.label == crate::audio::classifier::AudioLabel::NotOk));
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
        assert_eq!(audio.status().inference_count, 4);
    }

    #[test]
    fn test_multi_hop_chunk_sees_each_window_once() {
        let model = Arc::new(FixedClassifier::new(vec![0.9, 0.1]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model.clone()));

        // one window plus three hops in a single chunk
        let signal = tone(8000 + 3 * 800);
        let predictions = audio.feed_and_infer(&signal);
        assert_eq!(predictions.len(), 4);

        let windows = model.windows.lock().unwrap().clone();
        assert_eq!(windows.len(), 4);
        for (hop, window) in windows.iter().enumerate() {
            let mut expected = signal[hop * 800..hop * 800 + 8000].to_vec();
            normalize_window(&mut expected);
            assert_eq!(window, &expected, "window {} is not the one ending at its hop", hop);
        }
        assert!(windows.windows(2).all(|pair| pair[0] != pair[1]));
        assert_eq!(audio.status().accumulated_samples, 8000 - 800);
    }

    #[test]
    fn test_accumulation_is_bounded_by_buffer() {
        let model = Arc::new(FixedClassifier::new(vec![0.9, 0.1]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model.clone()));

        // 60000 samples into a 20000-sample ring: only hops whose window is
        // still buffered are classified
        let predictions = audio.feed_and_infer(&tone(60_000));
        assert_eq!(predictions.len(), (20_000 - 8000) / 800 + 1);
        assert!(audio.status().accumulated_samples < 8000);
    }

    #[test]
    fn test_window_is_standardized() {
        let model = Arc::new(FixedClassifier::new(vec![0.9, 0.1]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model.clone()));
        audio.feed(&tone(8000));
        audio.maybe_infer().unwrap();

        let window = model.windows.lock().unwrap()[0].clone();
        assert_eq!(window.len(), 8000);
        let mean = window.iter().sum::<f32>() / window.len() as f32;
        assert!(mean.abs() < 1e-3);
    }

    #[test]
    fn test_failure_still_advances() {
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(Arc::new(FailingClassifier)));
        audio.feed(&tone(8000));

        assert!(audio.maybe_infer().is_err());
        assert_eq!(audio.status().accumulated_samples, 8000 - 800);
        assert_eq!(audio.status().failure_count, 1);
        assert!(audio.last_prediction().is_none());
    }

    #[test]
    fn test_without_classifier() {
        let mut audio = AudioRubbingClassifier::new(&small_config(), None);
        assert!(audio.feed_and_infer(&tone(10_000)).is_empty());
        assert!(!audio.status().available);
    }

    #[test]
    fn test_reset() {
        let model = Arc::new(FixedClassifier::new(vec![0.9, 0.1]));
        let mut audio = AudioRubbingClassifier::new(&small_config(), Some(model));
        audio.feed_and_infer(&tone(9000));
        assert!(audio.last_prediction().is_some());

        audio.reset();
        let status = audio.status();
        assert_eq!(status.buffered_samples, 0);
        assert_eq!(status.inference_count, 0);
        assert!(status.last_prediction.is_none());
    }
}

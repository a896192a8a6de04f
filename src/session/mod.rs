//! # Purity Test Session
//!
//! One [`PuritySession`] per physical test in progress. It owns all of the
//! per-item state (visual detector, audio window, stage machine) and turns
//! raw frames and audio chunks into client-facing results.
//!
//! ## Frame Handling:
//! - Frames larger than the output size are downscaled first
//! - Only every `process_interval`-th frame runs the detectors
//! - Skipped frames are annotated with the last computed overlay
//! - Queued stage transitions are applied before the frame is looked at
//!
//! Nothing here is shared between sessions except the injected detector
//! and classifier handles.

pub mod fps;
pub mod manager;

use crate::audio::classifier::{AudioPrediction, Classifier};
use crate::audio::processor::{AudioFormatError, AudioPreprocessor, PcmFormat, PreparedChunk};
use crate::audio::rubbing::{AudioClassifierStatus, AudioRubbingClassifier};
use crate::config::AppConfig;
use crate::confirmation::{Stage, StageStateMachine, StageStatus};
use crate::session::fps::FpsCounter;
use crate::vision::acid::AcidEvaluator;
use crate::vision::codec::{downscale, encode_jpeg, FrameCodecError};
use crate::vision::detector::Detector;
use crate::vision::overlay::Overlay;
use crate::vision::rubbing::VisualRubbingDetector;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Model handles shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    /// Model registry for the stone, gold and acid detectors
    pub detector: Arc<dyn Detector>,
    /// Audio rubbing classifier; without one the audio gate never opens
    pub classifier: Option<Arc<dyn Classifier>>,
}

/// Annotated frame plus the status it was produced with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameResult {
    /// Base64 JPEG
    pub frame: String,
    /// Stage status after this frame
    pub status: StageStatus,
    /// Rolling frames per second over the last second
    pub fps: f32,
    /// Latency of the most recent detector pass (milliseconds)
    pub process_ms: f64,
    /// Whether the detectors ran on this frame or it reused the last overlay
    pub processed: bool,
    /// 1-based count of frames received since the last reset
    pub frame_index: u64,
}

/// A [`FrameResult`] together with its raw JPEG bytes.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Same image as `result.frame`, not base64 encoded
    pub jpeg: Vec<u8>,
    pub result: FrameResult,
}

/// Outcome of feeding one audio chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioUpdate {
    /// Mono samples at the model rate added to the window buffer
    pub samples: usize,
    pub rms: f32,
    /// Chunk fell below the silence threshold and cleared the audio result
    pub silent: bool,
    /// One prediction per window completed by this chunk, oldest first
    pub predictions: Vec<AudioPrediction>,
    pub gate_open: bool,
    pub status: StageStatus,
}

/// Snapshot of a session for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub stage: Stage,
    pub item_index: u32,
    pub frames_received: u64,
    /// Frames that ran the detectors; at most `frames_received`
    pub frames_processed: u64,
    pub fps: f32,
    pub process_ms: f64,
    pub created_at: DateTime<Utc>,
    /// Seconds since the last frame, audio chunk or reset
    pub idle_seconds: u64,
    pub status: StageStatus,
    pub audio: AudioClassifierStatus,
}

/// State of one purity test: detectors, audio window and stage machine.
pub struct PuritySession {
    id: String,
    visual: VisualRubbingDetector,
    acid: AcidEvaluator,
    audio: AudioRubbingClassifier,
    preprocessor: AudioPreprocessor,
    machine: StageStateMachine,
    overlay: Overlay,
    process_interval: u64,
    jpeg_quality: u8,
    max_width: u32,
    max_height: u32,
    frames_received: u64,
    frames_processed: u64,
    fps: FpsCounter,
    /// Last value from `fps`, reported on skipped frames too
    last_fps: f32,
    last_process_ms: f64,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl PuritySession {
    pub fn new(id: impl Into<String>, services: &SessionServices, config: &AppConfig) -> Self {
        let id = id.into();
        debug!(session_id = %id, "Creating purity session");
        Self {
            visual: VisualRubbingDetector::new(Arc::clone(&services.detector), &config.models, &config.vision),
            acid: AcidEvaluator::new(Arc::clone(&services.detector), &config.models),
            audio: AudioRubbingClassifier::new(&config.audio, services.classifier.clone()),
            preprocessor: AudioPreprocessor::new(
                config.audio.sample_rate,
                config.audio.silence_rms,
                config.audio.buffer_samples(),
            ),
            machine: StageStateMachine::new(config.vision.visual_confirm_frames, config.audio.confidence_threshold),
            overlay: Overlay::new(Stage::Rubbing),
            process_interval: config.pipeline.process_interval.max(1) as u64,
            jpeg_quality: config.pipeline.jpeg_quality,
            max_width: config.pipeline.max_width,
            max_height: config.pipeline.max_height,
            frames_received: 0,
            frames_processed: 0,
            fps: FpsCounter::new(),
            last_fps: 0.0,
            last_process_ms: 0.0,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> Stage {
        self.machine.stage()
    }

    pub fn item_index(&self) -> u32 {
        self.machine.item_index()
    }

    pub fn status(&self) -> StageStatus {
        self.machine.status()
    }

    /// Time since the session last saw a frame, audio or a reset.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Run one frame through the stage pipeline and annotate it.
    ///
    /// Returns the annotated frame and whether the detectors ran on it.
    pub fn process_frame(&mut self, frame: RgbImage) -> (RgbImage, bool) {
        self.last_activity = Instant::now();
        let mut frame = downscale(frame, self.max_width, self.max_height);

        self.frames_received += 1;
        let stage = self.machine.begin_frame();
        if self.overlay.stage != stage {
            self.overlay = Overlay::new(stage);
        }

        let analyze = self.frames_received % self.process_interval == 0;
        if analyze {
            let started = Instant::now();
            self.analyze(stage, &frame);
            self.last_process_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.frames_processed += 1;
        }

        self.overlay.draw(&mut frame);
        self.last_fps = self.fps.tick();
        (frame, analyze)
    }

    fn analyze(&mut self, stage: Stage, frame: &RgbImage) {
        match stage {
            Stage::Rubbing => {
                let report = self.visual.process(frame);
                self.machine.observe_rubbing(&report);
                self.overlay = Overlay {
                    stage,
                    stone: report.stone,
                    gold_mask: Some(report.gold_mask),
                    centroid: report.centroid,
                    acid_boxes: Vec::new(),
                    visual_ok: report.visual_ok,
                };
            }
            Stage::Acid => {
                let report = self.acid.evaluate(frame);
                self.machine.observe_acid(&report);
                self.overlay = Overlay {
                    acid_boxes: report.hits.iter().map(|hit| hit.bbox).collect(),
                    ..Overlay::new(stage)
                };
            }
            Stage::Done => {}
        }
    }

    /// [`Self::process_frame`] followed by JPEG encoding.
    pub fn process_frame_encoded(&mut self, frame: RgbImage) -> Result<EncodedFrame, FrameCodecError> {
        let (annotated, processed) = self.process_frame(frame);
        let jpeg = encode_jpeg(&annotated, self.jpeg_quality)?;
        let result = FrameResult {
            frame: STANDARD.encode(&jpeg),
            status: self.machine.status(),
            fps: self.last_fps,
            process_ms: self.last_process_ms,
            processed,
            frame_index: self.frames_received,
        };
        Ok(EncodedFrame { jpeg, result })
    }

    /// Feed interleaved device or upload audio.
    pub fn feed_audio(&mut self, interleaved: &[f32], format: PcmFormat) -> Result<AudioUpdate, AudioFormatError> {
        let chunk = self.preprocessor.prepare(interleaved, format)?;
        Ok(self.feed_prepared(chunk))
    }

    /// Feed raw little-endian PCM16 bytes.
    pub fn feed_pcm16(&mut self, data: &[u8], format: PcmFormat) -> Result<AudioUpdate, AudioFormatError> {
        let chunk = self.preprocessor.prepare_pcm16(data, format)?;
        Ok(self.feed_prepared(chunk))
    }

    /// Feed a complete WAV file; its header supplies the format.
    pub fn feed_wav(&mut self, data: &[u8]) -> Result<AudioUpdate, AudioFormatError> {
        let chunk = self.preprocessor.prepare_wav(data)?;
        Ok(self.feed_prepared(chunk))
    }

    fn feed_prepared(&mut self, chunk: PreparedChunk) -> AudioUpdate {
        self.last_activity = Instant::now();
        let predictions = self.audio.feed_and_infer(&chunk.samples);
        for prediction in &predictions {
            self.machine.record_audio(prediction.clone());
        }
        // silence is buffered but never counts as rubbing sound
        if chunk.silent {
            self.machine.clear_audio();
        }

        AudioUpdate {
            samples: chunk.samples.len(),
            rms: chunk.rms,
            silent: chunk.silent,
            predictions,
            gate_open: self.machine.audio_gate_open(),
            status: self.machine.status(),
        }
    }

    /// Switch item; a different index clears all per-item state.
    ///
    /// Returns `false` when the index is unchanged and nothing was reset.
    pub fn set_item_index(&mut self, item_index: u32) -> bool {
        self.last_activity = Instant::now();
        let previous = self.machine.item_index();
        if !self.machine.set_item_index(item_index) {
            return false;
        }
        self.clear_detection_state();
        info!(session_id = %self.id, from = previous, to = item_index, "Item changed, session state cleared");
        true
    }

    /// Back to the rubbing stage with every detector and buffer cleared.
    pub fn reset(&mut self) {
        self.last_activity = Instant::now();
        self.machine.reset();
        self.clear_detection_state();
        info!(session_id = %self.id, "Session reset");
    }

    fn clear_detection_state(&mut self) {
        self.visual.reset();
        self.audio.reset();
        self.overlay = Overlay::new(Stage::Rubbing);
        self.frames_received = 0;
        self.frames_processed = 0;
        self.fps.reset();
        self.last_fps = 0.0;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            stage: self.machine.stage(),
            item_index: self.machine.item_index(),
            frames_received: self.frames_received,
            frames_processed: self.frames_processed,
            fps: self.last_fps,
            process_ms: self.last_process_ms,
            created_at: self.created_at,
            idle_seconds: self.idle_for().as_secs(),
            status: self.machine.status(),
            audio: self.audio.status(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::rubbing::tests::FixedClassifier;
    use crate::vision::acid::GoldPurity;
    use crate::vision::rubbing::tests::RubbingScene;
    use std::sync::atomic::Ordering;

    pub(crate) fn services(scene: Arc<RubbingScene>, probabilities: Option<Vec<f32>>) -> SessionServices {
        SessionServices {
            detector: scene,
            classifier: probabilities.map(|p| Arc::new(FixedClassifier::new(p)) as Arc<dyn Classifier>),
        }
    }

    fn scene() -> Arc<RubbingScene> {
        Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)))
    }

    fn frame() -> RgbImage {
        RgbImage::new(200, 200)
    }

    /// Low-level noise that stays above the silence gate.
    fn rubbing_sound(samples: usize) -> Vec<f32> {
        (0..samples).map(|i| if i % 2 == 0 { 0.1 } else { -0.1 }).collect()
    }

    fn mono() -> PcmFormat {
        PcmFormat::new(16_000, 1)
    }

    #[test]
    fn test_only_every_kth_frame_is_analyzed() {
        let scene = scene();
        let mut session = PuritySession::new("s1", &services(Arc::clone(&scene), None), &AppConfig::default());

        let flags: Vec<bool> = (0..6).map(|_| session.process_frame(frame()).1).collect();
        assert_eq!(flags, vec![false, false, true, false, false, true]);
        assert_eq!(scene.stone_calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.summary().frames_processed, 2);
    }

    #[test]
    fn test_large_frames_are_downscaled() {
        let mut session = PuritySession::new("s1", &services(scene(), None), &AppConfig::default());
        let (annotated, _) = session.process_frame(RgbImage::new(1280, 960));
        assert_eq!(annotated.dimensions(), (640, 480));
    }

    #[test]
    fn test_encoded_frame_has_status() {
        let mut session = PuritySession::new("s1", &services(scene(), None), &AppConfig::default());
        let encoded = session.process_frame_encoded(frame()).unwrap();
        assert!(!encoded.jpeg.is_empty());
        assert!(!encoded.result.frame.is_empty());
        assert_eq!(encoded.result.status.task, Stage::Rubbing);
        assert_eq!(encoded.result.frame_index, 1);
    }

    #[test]
    fn test_without_audio_rubbing_never_confirms() {
        let mut session = PuritySession::new("s1", &services(scene(), None), &AppConfig::default());
        for _ in 0..60 {
            session.process_frame(frame());
        }
        assert!(session.status().visual_confirm_count >= 3);
        assert_eq!(session.stage(), Stage::Rubbing);
    }

    #[test]
    fn test_silence_closes_audio_gate() {
        let mut session = PuritySession::new("s1", &services(scene(), Some(vec![0.9, 0.1])), &AppConfig::default());
        let update = session.feed_audio(&rubbing_sound(32_000), mono()).unwrap();
        assert_eq!(update.predictions.len(), 1);
        assert!(update.gate_open);

        let update = session.feed_audio(&vec![0.0; 1_600], mono()).unwrap();
        assert!(update.silent);
        assert!(!update.gate_open);
    }

    #[test]
    fn test_end_to_end_rubbing_then_acid() {
        let scene = scene();
        let mut session = PuritySession::new(
            "e2e",
            &services(Arc::clone(&scene), Some(vec![0.9, 0.1])),
            &AppConfig::default(),
        );

        // one full window plus four hops: five qualifying windows
        let update = session.feed_audio(&rubbing_sound(32_000 + 4 * 3_200), mono()).unwrap();
        assert_eq!(update.predictions.len(), 5);
        assert!(update.gate_open);

        // five seconds of video at 30 fps
        for _ in 0..150 {
            session.process_frame(frame());
            if session.stage() != Stage::Rubbing {
                break;
            }
        }
        assert_eq!(session.stage(), Stage::Acid);
        assert!(session.status().rubbing_detected);

        scene.acid_enabled.store(true, Ordering::SeqCst);
        for _ in 0..6 {
            session.process_frame(frame());
        }
        let status = session.status();
        assert_eq!(session.stage(), Stage::Done);
        assert!(status.acid_detected);
        assert_eq!(status.gold_purity, Some(GoldPurity::K22));

        *scene.acid_class.lock().unwrap() = "acid_18k".to_string();
        for _ in 0..9 {
            session.process_frame(frame());
        }
        assert_eq!(session.stage(), Stage::Done);
        assert_eq!(session.status().gold_purity, Some(GoldPurity::K22));
    }

    #[test]
    fn test_item_change_resets_everything() {
        let mut session = PuritySession::new("s1", &services(scene(), Some(vec![0.9, 0.1])), &AppConfig::default());
        session.feed_audio(&rubbing_sound(32_000), mono()).unwrap();
        for _ in 0..30 {
            session.process_frame(frame());
        }
        assert_eq!(session.stage(), Stage::Acid);

        assert!(session.set_item_index(1));
        let summary = session.summary();
        assert_eq!(summary.stage, Stage::Rubbing);
        assert_eq!(summary.item_index, 1);
        assert_eq!(summary.status.visual_confirm_count, 0);
        assert_eq!(summary.status.audio_confirm_count, 0);
        assert_eq!(summary.audio.buffered_samples, 0);
        assert!(!session.set_item_index(1));
    }
}

//! # Visual Rubbing Detector
//!
//! Per-frame state for the rubbing stage of one session: the smoothed stone
//! box, the persisted gold mask and the centroid distance history.
//!
//! ## Per-frame flow:
//! 1. Detect the stone and keep the largest box, smoothed by [`StoneTracker`]
//! 2. Age the persisted gold mask, dropping it past `mask_ttl`
//! 3. Segment gold inside a padded crop around the stone, clipped to the stone box
//! 4. Track the centroid-to-stone-center distance and test it for oscillation
//! 5. Report `visual_ok` and bump the running confirmation count
//!
//! Detector failures are logged and treated as "nothing detected"; persisted
//! state is left as it was.

use crate::config::{ModelsConfig, VisionConfig};
use crate::vision::detector::{DetectParams, Detector};
use crate::vision::geometry::{BBox, BinaryMask};
use crate::vision::motion::{DistanceHistory, StoneTracker};
use image::{imageops, RgbImage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum padding around the stone box when cropping for gold segmentation.
const MIN_CROP_PAD: i32 = 5;
const CROP_PAD_RATIO: f32 = 0.2;

/// Outcome of one rubbing-stage frame.
#[derive(Debug, Clone)]
pub struct VisualReport {
    /// Smoothed stone box, if the stone was detected this frame
    pub stone: Option<BBox>,
    /// Fresh or persisted gold mask in frame coordinates; empty when none
    pub gold_mask: BinaryMask,
    /// Centroid of `gold_mask`, only when the stone was also found
    pub centroid: Option<(i32, i32)>,
    /// Centroid to stone-center distance pushed into the history this frame
    pub distance: Option<f32>,
    /// The distance history oscillates
    pub rubbing: bool,
    /// Rubbing with gold inside the stone box
    pub visual_ok: bool,
    /// Frames with `visual_ok` since the last reset
    pub visual_confirm_count: u32,
}

#[derive(Debug, Clone)]
struct PersistedMask {
    mask: BinaryMask,
    age: u32,
}

/// Visual half of the rubbing stage for one session.
pub struct VisualRubbingDetector {
    detector: Arc<dyn Detector>,
    stone_model: String,
    gold_model: String,
    params: DetectParams,
    mask_threshold: f32,
    mask_ttl: u32,
    fluctuation_threshold: f32,
    min_flips: usize,
    tracker: StoneTracker,
    history: DistanceHistory,
    /// Last gold mask seen, shown until it is older than `mask_ttl` frames
    persisted: Option<PersistedMask>,
    visual_confirm_count: u32,
}

impl VisualRubbingDetector {
    pub fn new(detector: Arc<dyn Detector>, models: &ModelsConfig, vision: &VisionConfig) -> Self {
        Self {
            detector,
            stone_model: models.stone_model.clone(),
            gold_model: models.gold_model.clone(),
            params: DetectParams {
                confidence: models.detect_confidence,
                iou: models.iou,
            },
            mask_threshold: vision.mask_threshold,
            mask_ttl: vision.mask_ttl,
            fluctuation_threshold: vision.fluctuation_threshold,
            min_flips: vision.min_flips,
            tracker: StoneTracker::new(vision.smoothing_alpha, vision.jitter_gate_px),
            history: DistanceHistory::new(vision.history_capacity),
            persisted: None,
            visual_confirm_count: 0,
        }
    }

    pub fn visual_confirm_count(&self) -> u32 {
        self.visual_confirm_count
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn stone(&self) -> Option<BBox> {
        self.tracker.current()
    }

    /// Clear every piece of per-item state.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.history.clear();
        self.persisted = None;
        self.visual_confirm_count = 0;
    }

    /// Evaluate one frame. Runs the stone model on the whole frame and the
    /// gold model on a crop around the stone.
    pub fn process(&mut self, frame: &RgbImage) -> VisualReport {
        let (width, height) = frame.dimensions();

        let stone = self.detect_stone(frame);
        let mut gold_mask = self.age_mask(width, height);

        if let Some(stone) = stone {
            if let Some(fresh) = self.segment_gold(frame, &stone) {
                self.persisted = Some(PersistedMask {
                    mask: fresh.clone(),
                    age: 0,
                });
                gold_mask = fresh;
            }
        }

        let mut centroid = None;
        let mut distance = None;
        let mut rubbing = false;
        if let Some(stone) = stone {
            if let Some((cx, cy)) = gold_mask.centroid() {
                let (sx, sy) = stone.center();
                let d = ((cx - sx) as f32).hypot((cy - sy) as f32);
                self.history.push(d);
                rubbing = self.history.is_oscillating(self.fluctuation_threshold, self.min_flips);
                centroid = Some((cx, cy));
                distance = Some(d);
            }
        }

        let visual_ok = match stone {
            Some(stone) => rubbing && !gold_mask.is_empty() && gold_mask.any_in_rect(&stone),
            None => false,
        };
        if visual_ok {
            self.visual_confirm_count += 1;
        }

        debug!(
            stone = ?stone,
            distance = ?distance,
            rubbing,
            visual_ok,
            confirmations = self.visual_confirm_count,
            "Rubbing frame evaluated"
        );

        VisualReport {
            stone,
            gold_mask,
            centroid,
            distance,
            rubbing,
            visual_ok,
            visual_confirm_count: self.visual_confirm_count,
        }
    }

    fn detect_stone(&mut self, frame: &RgbImage) -> Option<BBox> {
        match self.detector.predict(&self.stone_model, frame, self.params) {
            Ok(detections) => detections
                .largest_box()
                .map(|candidate| self.tracker.update(candidate.bbox())),
            Err(e) => {
                warn!(model = %self.stone_model, error = %e, "Stone detection failed");
                None
            }
        }
    }

    /// Age the stored mask by one frame and return what is still visible.
    fn age_mask(&mut self, width: u32, height: u32) -> BinaryMask {
        if let Some(persisted) = &self.persisted {
            if persisted.mask.dimensions() != (width, height) {
                self.persisted = None;
            }
        }

        let Some(persisted) = self.persisted.as_mut() else {
            return BinaryMask::empty(width, height);
        };

        persisted.age += 1;
        if persisted.age > self.mask_ttl {
            self.persisted = None;
            return BinaryMask::empty(width, height);
        }
        persisted.mask.clone()
    }

    /// Segment gold in a padded crop around `stone`, mapped back into
    /// frame coordinates and clipped to the stone box.
    fn segment_gold(&self, frame: &RgbImage, stone: &BBox) -> Option<BinaryMask> {
        let (width, height) = frame.dimensions();
        let pad = MIN_CROP_PAD.max((CROP_PAD_RATIO * stone.width().max(stone.height()) as f32) as i32);
        let region = stone.expand(pad).clamp_to(width, height)?;

        let crop = imageops::crop_imm(
            frame,
            region.x1 as u32,
            region.y1 as u32,
            region.width() as u32,
            region.height() as u32,
        )
        .to_image();

        let detections = match self.detector.predict(&self.gold_model, &crop, self.params) {
            Ok(detections) => detections,
            Err(e) => {
                warn!(model = %self.gold_model, error = %e, "Gold segmentation failed");
                return None;
            }
        };

        let raw = detections.masks.first()?;
        let local = raw
            .binarize(self.mask_threshold)
            .resize_nearest(crop.width(), crop.height());

        let mut full = BinaryMask::empty(width, height);
        full.paste(&local, region.x1 as u32, region.y1 as u32);
        full.retain_rect(stone);
        Some(full)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::vision::detector::{DetectionBox, DetectionError, Detections};
    use crate::vision::geometry::RawMask;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted detector for a fixed stone with a gold square that moves
    /// left and right across it on each gold call.
    pub(crate) struct RubbingScene {
        pub stone: Option<(f32, f32, f32, f32)>,
        pub gold_enabled: AtomicBool,
        pub acid_enabled: AtomicBool,
        pub acid_class: Mutex<String>,
        pub gold_calls: AtomicUsize,
        pub stone_calls: AtomicUsize,
        pub acid_calls: AtomicUsize,
    }

    impl RubbingScene {
        pub(crate) fn new(stone: (f32, f32, f32, f32)) -> Self {
            Self {
                stone: Some(stone),
                gold_enabled: AtomicBool::new(true),
                acid_enabled: AtomicBool::new(false),
                acid_class: Mutex::new("acid_22k".to_string()),
                gold_calls: AtomicUsize::new(0),
                stone_calls: AtomicUsize::new(0),
                acid_calls: AtomicUsize::new(0),
            }
        }

        /// Crop-sized mask holding a 10x10 square whose x offset alternates
        /// between left and right of the crop center.
        fn gold_mask(&self, width: u32, height: u32, call: usize) -> RawMask {
            let mut values = vec![0.0; (width * height) as usize];
            let x0 = if call % 2 == 0 {
                (width / 2).saturating_sub(30)
            } else {
                width / 2 + 40
            };
            let y0 = (height / 2).saturating_sub(5);
            for y in y0..(y0 + 10).min(height) {
                for x in x0..(x0 + 10).min(width) {
                    values[(y * width + x) as usize] = 0.9;
                }
            }
            RawMask {
                width,
                height,
                values,
            }
        }
    }

    impl Detector for RubbingScene {
        fn predict(&self, model: &str, image: &RgbImage, _params: DetectParams) -> Result<Detections, DetectionError> {
            match model {
                "stone" => {
                    self.stone_calls.fetch_add(1, Ordering::SeqCst);
                    let boxes = self
                        .stone
                        .map(|(x1, y1, x2, y2)| DetectionBox {
                            x1,
                            y1,
                            x2,
                            y2,
                            confidence: 0.9,
                            class_id: 0,
                        })
                        .into_iter()
                        .collect();
                    Ok(Detections {
                        boxes,
                        masks: Vec::new(),
                    })
                }
                "gold" => {
                    let call = self.gold_calls.fetch_add(1, Ordering::SeqCst);
                    if !self.gold_enabled.load(Ordering::SeqCst) {
                        return Ok(Detections::default());
                    }
                    Ok(Detections {
                        boxes: Vec::new(),
                        masks: vec![self.gold_mask(image.width(), image.height(), call)],
                    })
                }
                "acid" => {
                    self.acid_calls.fetch_add(1, Ordering::SeqCst);
                    if !self.acid_enabled.load(Ordering::SeqCst) {
                        return Ok(Detections::default());
                    }
                    Ok(Detections {
                        boxes: vec![DetectionBox {
                            x1: 10.0,
                            y1: 10.0,
                            x2: 40.0,
                            y2: 40.0,
                            confidence: 0.95,
                            class_id: 3,
                        }],
                        masks: Vec::new(),
                    })
                }
                other => Err(DetectionError::ModelUnavailable(other.to_string())),
            }
        }

        fn class_name(&self, model: &str, _class_id: u32) -> Option<String> {
            (model == "acid").then(|| {
                self.acid_class
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone()
            })
        }

        fn models(&self) -> Vec<String> {
            vec!["stone".into(), "gold".into(), "acid".into()]
        }
    }

    struct Broken;

    impl Detector for Broken {
        fn predict(&self, model: &str, _image: &RgbImage, _params: DetectParams) -> Result<Detections, DetectionError> {
            Err(DetectionError::Inference {
                model: model.to_string(),
                message: "boom".into(),
            })
        }
    }

    fn detector(scene: Arc<dyn Detector>) -> VisualRubbingDetector {
        VisualRubbingDetector::new(scene, &ModelsConfig::default(), &VisionConfig::default())
    }

    fn frame() -> RgbImage {
        RgbImage::new(200, 200)
    }

    #[test]
    fn test_oscillating_gold_confirms_visually() {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        let mut visual = detector(scene);

        let reports: Vec<VisualReport> = (0..6).map(|_| visual.process(&frame())).collect();

        assert!(reports.iter().all(|r| r.stone == Some(BBox::new(50, 50, 150, 150))));
        assert!(reports.iter().all(|r| !r.gold_mask.is_empty()));
        // distances alternate ~26px / ~44px; two reversals need four samples
        assert!(reports[..3].iter().all(|r| !r.rubbing && !r.visual_ok));
        assert!(reports[3].rubbing && reports[3].visual_ok);
        assert_eq!(reports[5].visual_confirm_count, 3);
        assert_eq!(visual.history_len(), 6);
    }

    #[test]
    fn test_gold_mask_is_clipped_to_stone() {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        let mut visual = detector(scene);
        let report = visual.process(&frame());

        let (width, height) = report.gold_mask.dimensions();
        assert_eq!((width, height), (200, 200));
        assert!(!report.gold_mask.any_in_rect(&BBox::new(0, 0, 200, 50)));
        assert!(!report.gold_mask.any_in_rect(&BBox::new(0, 150, 200, 200)));
        assert!(report.gold_mask.any_in_rect(&BBox::new(50, 50, 150, 150)));
    }

    #[test]
    fn test_mask_persists_for_ttl_frames() {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        let mut visual = detector(Arc::clone(&scene) as Arc<dyn Detector>);

        assert!(!visual.process(&frame()).gold_mask.is_empty());
        scene.gold_enabled.store(false, Ordering::SeqCst);

        let ttl = VisionConfig::default().mask_ttl;
        for _ in 1..=ttl {
            assert!(!visual.process(&frame()).gold_mask.is_empty());
        }
        assert!(visual.process(&frame()).gold_mask.is_empty());
    }

    #[test]
    fn test_no_stone_means_no_visual_ok() {
        let mut scene = RubbingScene::new((50.0, 50.0, 150.0, 150.0));
        scene.stone = None;
        let mut visual = detector(Arc::new(scene));

        for _ in 0..5 {
            let report = visual.process(&frame());
            assert!(!report.visual_ok);
        }
        assert_eq!(visual.visual_confirm_count(), 0);
    }

    #[test]
    fn test_detector_failure_is_no_detection() {
        let mut visual = detector(Arc::new(Broken));
        let report = visual.process(&frame());
        assert_eq!(report.stone, None);
        assert!(report.gold_mask.is_empty());
        assert!(!report.rubbing);
    }

    #[test]
    fn test_reset_clears_state() {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        let mut visual = detector(scene);
        for _ in 0..5 {
            visual.process(&frame());
        }
        assert!(visual.visual_confirm_count() > 0);

        visual.reset();
        assert_eq!(visual.visual_confirm_count(), 0);
        assert_eq!(visual.history_len(), 0);
        assert_eq!(visual.stone(), None);
    }
}

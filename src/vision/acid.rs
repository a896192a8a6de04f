//! Acid-stage evaluation: a stricter-threshold detector pass plus the karat
//! reading taken from the detected class name.

use crate::config::ModelsConfig;
use crate::vision::detector::{DetectParams, Detector};
use crate::vision::geometry::BBox;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Karat reading taken from the acid detector's class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GoldPurity {
    #[serde(rename = "24K")]
    K24,
    #[serde(rename = "22K")]
    K22,
    #[serde(rename = "18K")]
    K18,
}

impl GoldPurity {
    /// Find a karat marker in a detector class name, case-insensitively.
    pub fn from_class_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.contains("22k") {
            Some(Self::K22)
        } else if lower.contains("18k") {
            Some(Self::K18)
        } else if lower.contains("24k") {
            Some(Self::K24)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::K24 => "24K",
            Self::K22 => "22K",
            Self::K18 => "18K",
        }
    }
}

impl fmt::Display for GoldPurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcidHit {
    pub bbox: BBox,
    pub confidence: f32,
    /// Class name reported by the detector, when it has one
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcidReport {
    /// Boxes at or above the acid confidence, in detector order
    pub hits: Vec<AcidHit>,
    pub purity: Option<GoldPurity>,
}

impl AcidReport {
    pub fn detected(&self) -> bool {
        !self.hits.is_empty()
    }
}

pub struct AcidEvaluator {
    detector: Arc<dyn Detector>,
    model: String,
    params: DetectParams,
}

impl AcidEvaluator {
    pub fn new(detector: Arc<dyn Detector>, models: &ModelsConfig) -> Self {
        Self {
            detector,
            model: models.acid_model.clone(),
            params: DetectParams {
                confidence: models.acid_confidence,
                iou: models.iou,
            },
        }
    }

    /// Boxes below the acid confidence are dropped even if the detector
    /// returned them. The last hit carrying a karat marker sets the purity.
    pub fn evaluate(&self, frame: &RgbImage) -> AcidReport {
        let detections = match self.detector.predict(&self.model, frame, self.params) {
            Ok(detections) => detections,
            Err(e) => {
                warn!(model = %self.model, error = %e, "Acid detection failed");
                return AcidReport::default();
            }
        };

        let mut report = AcidReport::default();
        for candidate in detections.boxes.iter().filter(|b| b.confidence >= self.params.confidence) {
            let class_name = self.detector.class_name(&self.model, candidate.class_id);
            if let Some(purity) = class_name.as_deref().and_then(GoldPurity::from_class_name) {
                report.purity = Some(purity);
            }
            report.hits.push(AcidHit {
                bbox: candidate.bbox(),
                confidence: candidate.confidence,
                class_name,
            });
        }

        if report.detected() {
            debug!(hits = report.hits.len(), purity = ?report.purity, "Acid detected");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::detector::{DetectionBox, DetectionError, Detections};

    struct AcidScene {
        confidences: Vec<f32>,
        class_name: &'static str,
    }

    impl Detector for AcidScene {
        fn predict(&self, _model: &str, _image: &RgbImage, _params: DetectParams) -> Result<Detections, DetectionError> {
            Ok(Detections {
                boxes: self
                    .confidences
                    .iter()
                    .map(|&confidence| DetectionBox {
                        x1: 1.0,
                        y1: 1.0,
                        x2: 9.0,
                        y2: 9.0,
                        confidence,
                        class_id: 1,
                    })
                    .collect(),
                masks: Vec::new(),
            })
        }

        fn class_name(&self, _model: &str, _class_id: u32) -> Option<String> {
            Some(self.class_name.to_string())
        }
    }

    fn evaluate(confidences: Vec<f32>, class_name: &'static str) -> AcidReport {
        let evaluator = AcidEvaluator::new(Arc::new(AcidScene { confidences, class_name }), &ModelsConfig::default());
        evaluator.evaluate(&RgbImage::new(10, 10))
    }

    #[test]
    fn test_purity_parsing() {
        assert_eq!(GoldPurity::from_class_name("Acid_22K"), Some(GoldPurity::K22));
        assert_eq!(GoldPurity::from_class_name("gold-18k-test"), Some(GoldPurity::K18));
        assert_eq!(GoldPurity::from_class_name("24K"), Some(GoldPurity::K24));
        assert_eq!(GoldPurity::from_class_name("acid"), None);
        assert_eq!(serde_json::to_string(&GoldPurity::K22).unwrap(), "\"22K\"");
    }

    #[test]
    fn test_low_confidence_hits_are_ignored() {
        let report = evaluate(vec![0.5, 0.79], "acid_24k");
        assert!(!report.detected());
        assert_eq!(report.purity, None);
    }

    #[test]
    fn test_confident_hit_reports_purity() {
        let report = evaluate(vec![0.5, 0.92], "acid_18K");
        assert!(report.detected());
        assert_eq!(report.hits.len(), 1);
        assert_eq!(report.purity, Some(GoldPurity::K18));
    }
}

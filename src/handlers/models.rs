//! # Model Status
//!
//! Reports which detector models are registered, whether the audio
//! classifier is loaded, and the thresholds sessions will be built with.
//!
//! ## Endpoint: `GET /api/v1/models`
//!
//! ```json
//! {
//!   "detectors": {
//!     "registered": ["acid", "gold", "stone"],
//!     "stoneAvailable": true,
//!     "goldAvailable": true,
//!     "acidAvailable": true
//!   },
//!   "classifier": { "loaded": true, "name": "wave-cnn-1d", "audioGating": true },
//!   "thresholds": { "detectConfidence": 0.5, "acidConfidence": 0.8, ... }
//! }
//! ```

use crate::state::AppState;
use crate::vision::detector::DetectorStatus;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_models(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let models = &config.models;

    let detectors = DetectorStatus::from_models(
        state.detector.models(),
        &models.stone_model,
        &models.gold_model,
        &models.acid_model,
    );

    // without a classifier no audio prediction ever qualifies, so ACID is unreachable
    let classifier = match &state.classifier {
        Some(classifier) => json!({
            "loaded": true,
            "name": classifier.name(),
            "audioGating": true
        }),
        None => json!({
            "loaded": false,
            "name": null,
            "audioGating": false,
            "note": "No classifier weights configured; rubbing can never be confirmed"
        }),
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "detectors": detectors,
        "classifier": classifier,
        "models": {
            "stone": models.stone_model,
            "gold": models.gold_model,
            "acid": models.acid_model
        },
        "thresholds": {
            "detectConfidence": models.detect_confidence,
            "iou": models.iou,
            "acidConfidence": models.acid_confidence,
            "audioConfidence": config.audio.confidence_threshold,
            "callTimeoutMs": models.call_timeout_ms
        },
        "device": models.compute_device
    }))
}

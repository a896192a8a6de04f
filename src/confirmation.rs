//! # Stage Confirmation
//!
//! Fuses the per-frame visual report and the latest audio verdict into the
//! purity-test stage: RUBBING -> ACID -> DONE.
//!
//! ## Rules:
//! - **RUBBING -> ACID**: at least `visual_confirm_frames` visual-ok frames, rubbing
//!   motion on the evaluated frame, and the most recent audio verdict OK at or
//!   above the audio threshold
//! - **ACID -> DONE**: the first acid detection above the acid threshold
//! - **DONE** is terminal until an external reset
//!
//! Transitions are edge-triggered and queued. A queued transition takes
//! effect in [`StageStateMachine::begin_frame`], so the stage used to pick
//! the detector for a frame never changes while that frame is in flight.

use crate::audio::classifier::AudioPrediction;
use crate::vision::acid::{AcidReport, GoldPurity};
use crate::vision::rubbing::VisualReport;
use serde::Serialize;
use std::fmt;
use tracing::info;

pub const START_MESSAGE: &str = "Place gold on stone and start rubbing";
pub const RUBBING_CONFIRMED_MESSAGE: &str = "Rubbing Confirmed! Switch to Acid Test";
pub const COMPLETE_MESSAGE: &str = "Purity test complete! Both rubbing and acid detected.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Rubbing,
    Acid,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Rubbing => "rubbing",
            Stage::Acid => "acid",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing status, sent with every frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    pub task: Stage,
    pub rubbing_detected: bool,
    pub acid_detected: bool,
    pub message: String,
    pub gold_purity: Option<GoldPurity>,
    pub visual_confirm_count: u32,
    pub audio_confirm_count: u32,
    pub item_index: u32,
    pub audio: Option<AudioPrediction>,
}

#[derive(Debug, Clone)]
pub struct StageStateMachine {
    stage: Stage,
    pending: Option<Stage>,
    visual_required: u32,
    audio_threshold: f32,
    visual_confirm_count: u32,
    audio_confirm_count: u32,
    last_audio: Option<AudioPrediction>,
    rubbing_confirmed: bool,
    acid_detected: bool,
    gold_purity: Option<GoldPurity>,
    item_index: u32,
    message: String,
}

impl StageStateMachine {
    pub fn new(visual_required: u32, audio_threshold: f32) -> Self {
        Self {
            stage: Stage::Rubbing,
            pending: None,
            visual_required,
            audio_threshold,
            visual_confirm_count: 0,
            audio_confirm_count: 0,
            last_audio: None,
            rubbing_confirmed: false,
            acid_detected: false,
            gold_purity: None,
            item_index: 0,
            message: START_MESSAGE.to_string(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn pending(&self) -> Option<Stage> {
        self.pending
    }

    pub fn item_index(&self) -> u32 {
        self.item_index
    }

    pub fn visual_confirm_count(&self) -> u32 {
        self.visual_confirm_count
    }

    pub fn audio_confirm_count(&self) -> u32 {
        self.audio_confirm_count
    }

    pub fn last_audio(&self) -> Option<&AudioPrediction> {
        self.last_audio.as_ref()
    }

    /// Apply a queued transition and return the stage for this frame.
    pub fn begin_frame(&mut self) -> Stage {
        if let Some(next) = self.pending.take() {
            info!(from = %self.stage, to = %next, item = self.item_index, "Stage transition");
            self.stage = next;
        }
        self.stage
    }

    /// Record an audio verdict. The streak counter climbs on qualifying
    /// verdicts and decays toward zero otherwise.
    pub fn record_audio(&mut self, prediction: AudioPrediction) {
        if prediction.qualifies(self.audio_threshold) {
            self.audio_confirm_count += 1;
        } else {
            self.audio_confirm_count = self.audio_confirm_count.saturating_sub(1);
        }
        self.last_audio = Some(prediction);
    }

    /// Forget the last audio verdict, e.g. during silence.
    pub fn clear_audio(&mut self) {
        self.last_audio = None;
    }

    pub fn audio_gate_open(&self) -> bool {
        self.last_audio
            .as_ref()
            .is_some_and(|prediction| prediction.qualifies(self.audio_threshold))
    }

    /// Fold a rubbing-stage frame in. Returns true when ACID was queued.
    pub fn observe_rubbing(&mut self, report: &VisualReport) -> bool {
        if self.stage != Stage::Rubbing || self.pending.is_some() {
            return false;
        }

        self.visual_confirm_count = report.visual_confirm_count;
        let ready = self.visual_confirm_count >= self.visual_required && report.rubbing && self.audio_gate_open();

        if ready {
            self.rubbing_confirmed = true;
            self.pending = Some(Stage::Acid);
            self.message = RUBBING_CONFIRMED_MESSAGE.to_string();
        } else {
            self.message = format!("Visual confirmations: {}/{}", self.visual_confirm_count, self.visual_required);
        }
        ready
    }

    /// Fold an acid-stage frame in. Returns true when DONE was queued.
    pub fn observe_acid(&mut self, report: &AcidReport) -> bool {
        if self.stage != Stage::Acid || self.pending.is_some() || !report.detected() {
            return false;
        }

        self.acid_detected = true;
        self.gold_purity = report.purity;
        self.pending = Some(Stage::Done);
        self.message = COMPLETE_MESSAGE.to_string();
        true
    }

    /// Switch to another physical item. A change resets everything.
    pub fn set_item_index(&mut self, item_index: u32) -> bool {
        if item_index == self.item_index {
            return false;
        }
        self.reset();
        self.item_index = item_index;
        true
    }

    /// Back to RUBBING with every counter cleared. The item index is kept.
    pub fn reset(&mut self) {
        let item_index = self.item_index;
        *self = Self::new(self.visual_required, self.audio_threshold);
        self.item_index = item_index;
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            task: self.stage,
            rubbing_detected: self.rubbing_confirmed,
            acid_detected: self.acid_detected,
            message: self.message.clone(),
            gold_purity: self.gold_purity,
            visual_confirm_count: self.visual_confirm_count,
            audio_confirm_count: self.audio_confirm_count,
            item_index: self.item_index,
            audio: self.last_audio.clone(),
        }
    }
}

//! Frame annotation.
//!
//! An [`Overlay`] is what the last processed frame found. It is kept by the
//! session and painted onto every outgoing frame, including the skipped ones.

use crate::confirmation::Stage;
use crate::vision::geometry::{BBox, BinaryMask};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const STONE_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const GOLD_COLOR: Rgb<u8> = Rgb([0, 215, 255]);
const CENTROID_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const ACID_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const OK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const WAITING_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const DONE_TINT: [u8; 3] = [0, 100, 0];

const BANNER_HEIGHT: u32 = 8;
const CENTROID_RADIUS: i32 = 4;
const GOLD_ALPHA: f32 = 0.5;
const DONE_ALPHA: f32 = 0.3;

/// Annotations painted onto outgoing frames.
#[derive(Debug, Clone)]
pub struct Overlay {
    /// Selects the banner color; `Done` also tints the whole frame
    pub stage: Stage,
    pub stone: Option<BBox>,
    /// Tinted gold; ignored when its size differs from the frame
    pub gold_mask: Option<BinaryMask>,
    pub centroid: Option<(i32, i32)>,
    pub acid_boxes: Vec<BBox>,
    /// Rubbing confirmed on this frame; turns the banner green
    pub visual_ok: bool,
}

impl Overlay {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            stone: None,
            gold_mask: None,
            centroid: None,
            acid_boxes: Vec::new(),
            visual_ok: false,
        }
    }

    /// Paint mask, boxes, centroid and stage banner in place.
    pub fn draw(&self, frame: &mut RgbImage) {
        if let Some(mask) = &self.gold_mask {
            // a mask from a different frame size is stale
            if mask.dimensions() == frame.dimensions() {
                tint_mask(frame, mask);
            }
        }

        if let Some(stone) = self.stone {
            if let Some(rect) = to_rect(stone, frame) {
                draw_hollow_rect_mut(frame, rect, STONE_COLOR);
            }
        }

        if let Some(center) = self.centroid {
            draw_filled_circle_mut(frame, center, CENTROID_RADIUS, CENTROID_COLOR);
        }

        for acid in &self.acid_boxes {
            if let Some(rect) = to_rect(*acid, frame) {
                draw_hollow_rect_mut(frame, rect, ACID_COLOR);
                if let Some(inner) = to_rect(acid.expand(-1), frame) {
                    draw_hollow_rect_mut(frame, inner, ACID_COLOR);
                }
            }
        }

        self.draw_banner(frame);
    }

    /// Stage strip along the top edge.
    fn draw_banner(&self, frame: &mut RgbImage) {
        let color = match self.stage {
            Stage::Rubbing if self.visual_ok => OK_COLOR,
            Stage::Rubbing => WAITING_COLOR,
            Stage::Acid => ACID_COLOR,
            Stage::Done => OK_COLOR,
        };

        if self.stage == Stage::Done {
            blend_all(frame, DONE_TINT, DONE_ALPHA);
        }

        let height = BANNER_HEIGHT.min(frame.height());
        if frame.width() > 0 && height > 0 {
            draw_filled_rect_mut(frame, Rect::at(0, 0).of_size(frame.width(), height), color);
        }
    }
}

fn to_rect(bbox: BBox, frame: &RgbImage) -> Option<Rect> {
    let clamped = bbox.clamp_to(frame.width(), frame.height())?;
    Some(Rect::at(clamped.x1, clamped.y1).of_size(clamped.width() as u32, clamped.height() as u32))
}

fn blend(pixel: &mut Rgb<u8>, color: [u8; 3], alpha: f32) {
    for (channel, target) in pixel.0.iter_mut().zip(color) {
        *channel = (*channel as f32 * (1.0 - alpha) + target as f32 * alpha) as u8;
    }
}

fn tint_mask(frame: &mut RgbImage, mask: &BinaryMask) {
    for (pixel, value) in frame.pixels_mut().zip(mask.as_image().as_raw()) {
        if *value > 0 {
            blend(pixel, GOLD_COLOR.0, GOLD_ALPHA);
        }
    }
}

fn blend_all(frame: &mut RgbImage, color: [u8; 3], alpha: f32) {
    for pixel in frame.pixels_mut() {
        blend(pixel, color, alpha);
    }
}

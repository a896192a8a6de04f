//! Boxes and masks in frame pixel coordinates.

use image::{imageops, GrayImage, Luma};
use serde::Serialize;

/// Axis-aligned integer box, corners `(x1, y1)` inclusive and `(x2, y2)` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncate float detector coordinates toward zero.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Exact center, used for displacement checks.
    pub fn center_f64(&self) -> (f64, f64) {
        (
            (self.x1 + self.x2) as f64 / 2.0,
            (self.y1 + self.y2) as f64 / 2.0,
        )
    }

    /// Floor-divided center, used for distance measurements.
    pub fn center(&self) -> (i32, i32) {
        (
            (self.x1 + self.x2).div_euclid(2),
            (self.y1 + self.y2).div_euclid(2),
        )
    }

    /// Intersection with the `width x height` frame, `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BBox> {
        let clamped = BBox::new(
            self.x1.clamp(0, width as i32),
            self.y1.clamp(0, height as i32),
            self.x2.clamp(0, width as i32),
            self.y2.clamp(0, height as i32),
        );
        (clamped.width() > 0 && clamped.height() > 0).then_some(clamped)
    }

    /// Grow by `pad` pixels on every side.
    pub fn expand(&self, pad: i32) -> BBox {
        BBox::new(self.x1 - pad, self.y1 - pad, self.x2 + pad, self.y2 + pad)
    }
}

/// Segmentation output as returned by a detector: per-pixel scores in
/// row-major order at the model's own resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMask {
    pub width: u32,
    pub height: u32,
    /// `width * height` scores, row-major
    pub values: Vec<f32>,
}

impl RawMask {
    /// `None` when either side is zero or `values` has the wrong length.
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Option<Self> {
        (width > 0 && height > 0 && values.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            values,
        })
    }

    /// Threshold into a binary mask at the model's resolution.
    pub fn binarize(&self, threshold: f32) -> BinaryMask {
        let pixels = self
            .values
            .iter()
            .map(|&v| if v > threshold { 255 } else { 0 })
            .collect();
        // length matches width*height by construction
        let image = GrayImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height));
        BinaryMask(image)
    }
}

/// Single-channel mask, 255 for set pixels and 0 elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryMask(GrayImage);

impl BinaryMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self(GrayImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    /// Backing image, 255 for set pixels.
    pub fn as_image(&self) -> &GrayImage {
        &self.0
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width() && y < self.height() && self.0.get_pixel(x, y).0[0] > 0
    }

    pub fn set(&mut self, x: u32, y: u32) {
        if x < self.width() && y < self.height() {
            self.0.put_pixel(x, y, Luma([255]));
        }
    }

    pub fn count(&self) -> usize {
        self.0.as_raw().iter().filter(|&&v| v > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.0.as_raw().iter().any(|&v| v > 0)
    }

    /// Nearest-neighbour resize, keeping the mask strictly binary.
    pub fn resize_nearest(&self, width: u32, height: u32) -> BinaryMask {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        BinaryMask(imageops::resize(&self.0, width, height, imageops::FilterType::Nearest))
    }

    /// Paste `patch` with its top-left corner at `(x, y)`, clipping at the edges.
    pub fn paste(&mut self, patch: &BinaryMask, x: u32, y: u32) {
        imageops::replace(&mut self.0, &patch.0, x as i64, y as i64);
    }

    /// Clear everything outside `rect`.
    pub fn retain_rect(&mut self, rect: &BBox) {
        let (width, height) = self.dimensions();
        let Some(rect) = rect.clamp_to(width, height) else {
            for pixel in self.0.pixels_mut() {
                pixel.0[0] = 0;
            }
            return;
        };

        for (x, y, pixel) in self.0.enumerate_pixels_mut() {
            let inside = (x as i32) >= rect.x1
                && (x as i32) < rect.x2
                && (y as i32) >= rect.y1
                && (y as i32) < rect.y2;
            if !inside {
                pixel.0[0] = 0;
            }
        }
    }

    /// True if any set pixel lies inside `rect`.
    pub fn any_in_rect(&self, rect: &BBox) -> bool {
        let (width, height) = self.dimensions();
        let Some(rect) = rect.clamp_to(width, height) else {
            return false;
        };

        (rect.y1..rect.y2).any(|y| (rect.x1..rect.x2).any(|x| self.get(x as u32, y as u32)))
    }

    /// Pixel-moment centroid, truncated to integers. `None` for an empty mask.
    pub fn centroid(&self) -> Option<(i32, i32)> {
        let (mut m00, mut m10, mut m01) = (0u64, 0u64, 0u64);
        for (x, y, pixel) in self.0.enumerate_pixels() {
            if pixel.0[0] > 0 {
                m00 += 1;
                m10 += x as u64;
                m01 += y as u64;
            }
        }

        (m00 > 0).then(|| ((m10 / m00) as i32, (m01 / m00) as i32))
    }
}

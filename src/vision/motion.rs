//! Rubbing-motion primitives: the centroid distance history with its
//! oscillation test, and the jitter-gated stone box smoother.

use crate::vision::geometry::BBox;
use std::collections::VecDeque;

/// Bounded FIFO of centroid-to-stone-center distances.
#[derive(Debug, Clone)]
pub struct DistanceHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl DistanceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a distance, evicting the oldest once full.
    pub fn push(&mut self, distance: f32) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(distance);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f32> {
        self.values.back().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// See [`is_oscillating`].
    pub fn is_oscillating(&self, threshold: f32, min_flips: usize) -> bool {
        let (front, back) = self.values.as_slices();
        if back.is_empty() {
            is_oscillating(front, threshold, min_flips)
        } else {
            let joined: Vec<f32> = front.iter().chain(back).copied().collect();
            is_oscillating(&joined, threshold, min_flips)
        }
    }
}

/// Back-and-forth motion test over a distance sequence.
///
/// A step between consecutive distances is meaningful when its magnitude
/// reaches `threshold`. Motion counts as oscillating when there are at
/// least two meaningful steps and their direction reverses at least
/// `min_flips` times. Monotonic drift never qualifies.
pub fn is_oscillating(distances: &[f32], threshold: f32, min_flips: usize) -> bool {
    if distances.len() < 3 {
        return false;
    }

    let directions: Vec<bool> = distances
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|step| step.abs() >= threshold)
        .map(|step| step > 0.0)
        .collect();

    if directions.len() < 2 {
        return false;
    }

    let flips = directions.windows(2).filter(|pair| pair[0] != pair[1]).count();
    flips >= min_flips
}

/// Jitter-gated exponential smoothing of the stone box.
///
/// A new box whose center moved less than `gate_px` from the smoothed box
/// is ignored. Otherwise each corner moves `alpha` of the way toward the
/// new box, truncated to whole pixels.
#[derive(Debug, Clone)]
pub struct StoneTracker {
    alpha: f64,
    gate_px: f64,
    smoothed: Option<BBox>,
}

impl StoneTracker {
    pub fn new(alpha: f32, gate_px: f32) -> Self {
        Self {
            alpha: alpha as f64,
            gate_px: gate_px as f64,
            smoothed: None,
        }
    }

    pub fn current(&self) -> Option<BBox> {
        self.smoothed
    }

    /// Fold in a new detection and return the smoothed box.
    pub fn update(&mut self, observed: BBox) -> BBox {
        let next = match self.smoothed {
            None => observed,
            Some(previous) => {
                let (px, py) = previous.center_f64();
                let (cx, cy) = observed.center_f64();
                if (cx - px).hypot(cy - py) < self.gate_px {
                    previous
                } else {
                    // old*(1-a) + new*a, written so unchanged corners stay exact
                    let blend = |new: i32, old: i32| {
                        (old as f64 + (new - old) as f64 * self.alpha) as i32
                    };
                    BBox::new(
                        blend(observed.x1, previous.x1),
                        blend(observed.y1, previous.y1),
                        blend(observed.x2, previous.x2),
                        blend(observed.y2, previous.y2),
                    )
                }
            }
        };

        self.smoothed = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
    }
}

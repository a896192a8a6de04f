//! # Ring Sample Buffer
//!
//! Fixed-capacity circular buffer of mono `f32` samples feeding the audio
//! rubbing classifier.
//!
//! ## Key Features:
//! - **Wraparound write**: a batch crossing the end of storage is split into two copies
//! - **Windowed read**: the most recent `size` samples, concatenating tail and head when wrapped,
//!   or the `size` samples ending `lag` samples before the cursor
//! - **Sliding hop**: an "accumulated since last inference" counter that `advance` walks back
//!   by the hop size, so successive windows overlap instead of restarting from empty
//! - **No reallocation**: storage is allocated once in `new` and only zeroed by `reset`

use thiserror::Error;

/// Failures reading a window out of the ring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("insufficient data: requested {requested} samples but only {available} have been written")]
    InsufficientData { requested: usize, available: usize },

    #[error("window of {requested} samples exceeds buffer capacity of {capacity}")]
    WindowTooLarge { requested: usize, capacity: usize },
}

/// Circular sample store with a write cursor and an accumulated-sample counter.
///
/// ## Invariants:
/// - `cursor < capacity` at all times
/// - `accumulated <= capacity`: samples older than the ring cannot be windowed
/// - storage length never changes after construction
#[derive(Debug, Clone)]
pub struct RingSampleBuffer {
    data: Box<[f32]>,
    cursor: usize,
    written: usize,
    accumulated: usize,
}

impl RingSampleBuffer {
    /// Create a buffer holding `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity.max(1)].into_boxed_slice(),
            cursor: 0,
            written: 0,
            accumulated: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Index the next sample will be written to.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Samples accumulated since the window last advanced.
    pub fn accumulated(&self) -> usize {
        self.accumulated
    }

    /// Number of valid samples currently held.
    pub fn len(&self) -> usize {
        self.written.min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append a batch of samples.
    ///
    /// Only the trailing `capacity` samples of an oversized batch can survive,
    /// so those are the only ones copied; the cursor still moves as if the
    /// whole batch had been written.
    pub fn write(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let capacity = self.capacity();
        let skipped = samples.len().saturating_sub(capacity);
        let kept = &samples[skipped..];

        let start = (self.cursor + skipped % capacity) % capacity;
        let first = (capacity - start).min(kept.len());
        self.data[start..start + first].copy_from_slice(&kept[..first]);

        let rest = kept.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&kept[first..]);
        }

        self.cursor = (start + kept.len()) % capacity;
        self.written = self.written.saturating_add(samples.len());
        self.accumulated = self.accumulated.saturating_add(samples.len()).min(capacity);
    }

    /// Copy out the most recent `size` samples in chronological order.
    pub fn read_window(&self, size: usize) -> Result<Vec<f32>, BufferError> {
        self.read_window_at(size, 0)
    }

    /// Copy out the `size` samples that end `lag` samples before the cursor.
    ///
    /// `size + lag` must fit in the ring and must not exceed what has been
    /// written.
    pub fn read_window_at(&self, size: usize, lag: usize) -> Result<Vec<f32>, BufferError> {
        let capacity = self.capacity();
        let span = size.saturating_add(lag);
        if span > capacity {
            return Err(BufferError::WindowTooLarge {
                requested: span,
                capacity,
            });
        }

        if self.written < span {
            return Err(BufferError::InsufficientData {
                requested: span,
                available: self.written,
            });
        }

        let start = (self.cursor + capacity - span) % capacity;
        let mut window = Vec::with_capacity(size);
        if start + size <= capacity {
            window.extend_from_slice(&self.data[start..start + size]);
        } else {
            let tail = capacity - start;
            window.extend_from_slice(&self.data[start..]);
            window.extend_from_slice(&self.data[..size - tail]);
        }

        Ok(window)
    }

    /// Move the logical window forward by `n` samples.
    pub fn advance(&mut self, n: usize) {
        self.accumulated = self.accumulated.saturating_sub(n);
    }

    /// Zero all state, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
        self.cursor = 0;
        self.written = 0;
        self.accumulated = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: usize, to: usize) -> Vec<f32> {
        (from..to).map(|v| v as f32).collect()
    }

    #[test]
    fn test_read_before_full_returns_latest_samples() {
        let mut ring = RingSampleBuffer::new(8);
        ring.write(&ramp(0, 5));

        assert_eq!(ring.read_window(3).unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.cursor(), 5);
    }

    #[test]
    fn test_window_across_wrap_boundary() {
        let mut ring = RingSampleBuffer::new(8);
        ring.write(&ramp(0, 6));
        ring.write(&ramp(6, 11));

        // 11 samples written into 8 slots: the cursor wrapped to 3.
        assert_eq!(ring.cursor(), 3);
        assert_eq!(ring.read_window(8).unwrap(), ramp(3, 11));
        assert_eq!(ring.read_window(5).unwrap(), ramp(6, 11));
    }

    #[test]
    fn test_many_writes_keep_most_recent_capacity() {
        let mut ring = RingSampleBuffer::new(10);
        let mut next = 0;
        for chunk in [3, 7, 4, 9, 1, 5] {
            ring.write(&ramp(next, next + chunk));
            next += chunk;
        }

        assert_eq!(ring.read_window(10).unwrap(), ramp(next - 10, next));
        assert!(ring.cursor() < ring.capacity());
    }

    #[test]
    fn test_batch_larger_than_capacity() {
        let mut ring = RingSampleBuffer::new(4);
        ring.write(&ramp(0, 2));
        ring.write(&ramp(2, 13));

        assert_eq!(ring.read_window(4).unwrap(), ramp(9, 13));
        assert_eq!(ring.cursor(), 13 % 4);
        // the counter saturates at capacity
        assert_eq!(ring.accumulated(), 4);
    }

    #[test]
    fn test_insufficient_data() {
        let mut ring = RingSampleBuffer::new(16);
        ring.write(&ramp(0, 4));

        assert_eq!(
            ring.read_window(5),
            Err(BufferError::InsufficientData {
                requested: 5,
                available: 4
            })
        );
        assert!(matches!(
            ring.read_window(17),
            Err(BufferError::WindowTooLarge { .. })
        ));
    }

    #[test]
    fn test_advance_models_sliding_hop() {
        let mut ring = RingSampleBuffer::new(100);
        ring.write(&ramp(0, 40));
        ring.advance(10);
        assert_eq!(ring.accumulated(), 30);

        ring.advance(1000);
        assert_eq!(ring.accumulated(), 0);
        // Advancing never discards samples.
        assert_eq!(ring.read_window(40).unwrap(), ramp(0, 40));
    }

    #[test]
    fn test_lagged_window() {
        let mut ring = RingSampleBuffer::new(10);
        ring.write(&ramp(0, 14));

        assert_eq!(ring.read_window_at(4, 3).unwrap(), ramp(7, 11));
        assert_eq!(ring.read_window_at(4, 0).unwrap(), ring.read_window(4).unwrap());
        assert!(matches!(
            ring.read_window_at(4, 7),
            Err(BufferError::WindowTooLarge { requested: 11, .. })
        ));

        let mut short = RingSampleBuffer::new(10);
        short.write(&ramp(0, 5));
        assert_eq!(
            short.read_window_at(3, 3),
            Err(BufferError::InsufficientData {
                requested: 6,
                available: 5
            })
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let mut ring = RingSampleBuffer::new(6);
        ring.write(&ramp(1, 10));
        ring.reset();

        assert!(ring.is_empty());
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.accumulated(), 0);
        assert_eq!(ring.capacity(), 6);
        assert!(ring.read_window(1).is_err());
    }
}

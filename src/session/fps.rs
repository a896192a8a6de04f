use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Rolling frames-per-second over the last second.
#[derive(Debug, Clone, Default)]
pub struct FpsCounter {
    ticks: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame now and return frames seen in the last second.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> f32 {
        self.ticks.push_back(now);
        while let Some(&oldest) = self.ticks.front() {
            if now.duration_since(oldest) > WINDOW {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.ticks.len() as f32
    }

    pub fn reset(&mut self) {
        self.ticks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_ticks_in_last_second() {
        let mut fps = FpsCounter::new();
        let start = Instant::now();
        for i in 0..30 {
            fps.tick_at(start + Duration::from_millis(i * 33));
        }
        assert_eq!(fps.tick_at(start + Duration::from_millis(990)), 31.0);

        // everything before 1.5s - 1s = 0.5s has expired
        let later = fps.tick_at(start + Duration::from_millis(1500));
        assert!(later < 20.0);
    }
}

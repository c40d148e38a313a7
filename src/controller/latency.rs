//! Rewrite-latency sampling and the concurrency ladder.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples at or below this are cache hits or trivial rejections and
/// would drag the average into meaninglessness.
pub const SAMPLE_FLOOR: Duration = Duration::from_secs(5);
/// Sliding window capacity.
pub const WINDOW_CAPACITY: usize = 20;
/// Below this many samples the ladder holds at the current level.
pub const WARM_UP_SAMPLES: usize = 3;

/// Sliding window of meaningful rewrite durations.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
    floor: Duration,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(WINDOW_CAPACITY, SAMPLE_FLOOR)
    }
}

impl LatencyWindow {
    pub fn new(capacity: usize, floor: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            floor,
        }
    }

    /// Admit a sample. Durations at or below the floor are dropped.
    pub fn record(&mut self, sample: Duration) {
        if sample <= self.floor {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Target concurrency given the current active worker count.
    ///
    /// Insufficient samples hold the line. Otherwise the average maps to
    /// an adjustment: fast responses scale up by two, moderate by one,
    /// slowing responses back off, and a saturated backend drops straight
    /// to one. Floor of one, no upper bound; the backend's own latency is
    /// the ceiling.
    pub fn target_concurrency(&self, active: usize) -> usize {
        if self.samples.len() < WARM_UP_SAMPLES {
            return active.max(1);
        }
        let avg = match self.average() {
            Some(a) => a.as_secs_f64(),
            None => return active.max(1),
        };
        if avg < 30.0 {
            active + 2
        } else if avg < 45.0 {
            active + 1
        } else if avg < 60.0 {
            active.max(1)
        } else if avg < 90.0 {
            active.saturating_sub(1).max(1)
        } else {
            1
        }
    }

    /// Pause between consecutive worker launches, proportional to the
    /// most recent latency so a slow backend is not hit with a thundering
    /// herd of fresh workers.
    pub fn stagger(&self) -> Duration {
        let last = self.last().unwrap_or(Duration::ZERO).as_secs_f64();
        Duration::from_secs_f64((last * 0.1).clamp(1.0, 5.0))
    }
}

//! Windowed false-positive counting for the address filter

use std::time::{Duration, Instant};
use tracing::debug;

/// Counts bloom filter false positives inside a fixed window. The count only
/// grows within a window and never exceeds the threshold: reaching it asks
/// for a filter reload and starts a new window.
#[derive(Debug, Clone)]
pub struct FalsePositiveMonitor {
    threshold: u32,
    window: Duration,
    count: u32,
    window_start: Option<Instant>,
}

impl FalsePositiveMonitor {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            count: 0,
            window_start: None,
        }
    }

    /// Record one false positive. Returns `true` when the filter should be reloaded.
    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> bool {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) <= self.window => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }

        self.count += 1;
        debug!("False positive {}/{} in current window", self.count, self.threshold);
        if self.count >= self.threshold {
            self.reset();
            return true;
        }
        false
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }
}

//! Rolling window of operation latencies.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

const MAX_SAMPLES: usize = 1024;

/// Bounded sample window; oldest samples fall off first.
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples_us: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let Ok(mut samples) = self.samples_us.lock() else {
            return;
        };
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_micros() as u64);
    }

    pub fn len(&self) -> usize {
        self.samples_us.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 95th percentile in milliseconds, 0.0 when no samples exist.
    pub fn p95_ms(&self) -> f64 {
        let Ok(samples) = self.samples_us.lock() else {
            return 0.0;
        };
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    }
}

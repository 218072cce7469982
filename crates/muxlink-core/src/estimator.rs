//! Fixed-window moving average.
//!
//! Used for both inbound throughput (bytes/sec samples per received group)
//! and round-trip time (ms samples per pong). The window is seeded with an
//! initial sample so estimates are usable before real measurements arrive.

use std::collections::VecDeque;

/// Arithmetic mean over the most recent `max_values` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<i64>,
    sum: i64,
    max_values: usize,
}

impl MovingAverage {
    /// Create a window of `max_values` samples, pre-seeded with `initial`.
    pub fn new(max_values: usize, initial: i64) -> MovingAverage {
        let mut avg = MovingAverage {
            samples: VecDeque::with_capacity(max_values.min(1024)),
            sum: 0,
            max_values: max_values.max(1),
        };
        avg.record(initial);
        avg
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: i64) {
        self.samples.push_back(value);
        self.sum += value;
        if self.samples.len() > self.max_values {
            let evicted = self.samples.pop_front().expect("window non-empty");
            self.sum -= evicted;
        }
    }

    /// The floored mean of the current window.
    pub fn value(&self) -> i64 {
        self.sum.div_euclid(self.samples.len() as i64)
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

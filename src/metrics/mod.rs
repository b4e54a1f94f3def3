//! Arrival latency metrics.
//!
//! Tracks, per event, the delay between the block time assigned by the
//! chain and the moment the engine saw the event. Samples accumulate until
//! the reporter drains them; each drain yields the count and mean delay for
//! the window since the previous drain.

pub mod reporter;

use crate::event::TimestampUnit;
use parking_lot::Mutex;

pub use reporter::{MetricsReport, MetricsReporter, ReportError};

/// A single latency measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub block_timestamp: i64,
    pub local_timestamp: i64,
}

impl LatencySample {
    /// Delay in the accumulator's input unit.
    pub fn delay(&self) -> i64 {
        self.local_timestamp - self.block_timestamp
    }
}

/// Lock-scoped sample buffer with atomic drain.
pub struct LatencyAccumulator {
    samples: Mutex<Vec<LatencySample>>,
    /// Unit of the timestamps passed to `record`.
    unit: TimestampUnit,
}

impl LatencyAccumulator {
    pub fn new(unit: TimestampUnit) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            unit,
        }
    }

    /// Record a latency measurement.
    pub fn record(&self, block_timestamp: i64, local_timestamp: i64) {
        let sample = LatencySample {
            block_timestamp,
            local_timestamp,
        };
        self.samples.lock().push(sample);
    }

    /// Take every sample recorded since the last flush and return
    /// `(count, average delay in seconds)`. `(0, 0.0)` when nothing was recorded.
    pub fn flush_and_reset(&self) -> (usize, f64) {
        let drained = std::mem::take(&mut *self.samples.lock());
        if drained.is_empty() {
            return (0, 0.0);
        }

        let total: f64 = drained.iter().map(|s| s.delay() as f64).sum();
        let avg = total / drained.len() as f64 / self.unit.per_second();
        (drained.len(), avg)
    }

    /// Samples waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.samples.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_flush() {
        let acc = LatencyAccumulator::new(TimestampUnit::Seconds);
        assert_eq!(acc.flush_and_reset(), (0, 0.0));
    }

    #[test]
    fn test_average_delay() {
        let acc = LatencyAccumulator::new(TimestampUnit::Seconds);
        acc.record(100, 105);
        acc.record(200, 202);
        assert_eq!(acc.flush_and_reset(), (2, 3.5));
        // Drained exactly once.
        assert_eq!(acc.flush_and_reset(), (0, 0.0));
    }

    #[test]
    fn test_millisecond_inputs_report_seconds() {
        let acc = LatencyAccumulator::new(TimestampUnit::Milliseconds);
        acc.record(1_000, 2_500);
        acc.record(1_000, 1_500);
        assert_eq!(acc.flush_and_reset(), (2, 1.0));
    }

    #[test]
    fn test_no_sample_lost_across_concurrent_flushes() {
        let acc = Arc::new(LatencyAccumulator::new(TimestampUnit::Seconds));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        acc.record(i, i + 1);
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for _ in 0..50 {
            seen += acc.flush_and_reset().0;
        }
        for w in writers {
            w.join().unwrap();
        }
        seen += acc.flush_and_reset().0;
        assert_eq!(seen, 4_000);
    }
}

//! Pipeline self-observability metrics.
//!
//! Counters are plain `AtomicU64`s so any number of stages can record without
//! coordinating. Only the latency sample buffer is behind a lock, and that lock
//! is held just long enough to append one sample or copy the buffer out.

use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Default number of latency samples retained for percentile computation.
pub const DEFAULT_LATENCY_SAMPLES: usize = 1000;

/// Live metrics for one pipeline run.
///
/// Constructed once and shared via `Arc` with every component that records.
#[derive(Debug)]
pub struct PipelineMetrics {
    spans_received: AtomicU64,
    spans_processed: AtomicU64,
    spans_dropped: AtomicU64,
    spans_exported: AtomicU64,
    export_errors: AtomicU64,
    processing_times: RwLock<VecDeque<Duration>>,
    max_samples: usize,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Counters use `Ordering::Relaxed`: they are statistics only and guard no other
// data, so slightly stale reads in a snapshot are acceptable.
impl PipelineMetrics {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LATENCY_SAMPLES)
    }

    /// Creates a metrics engine retaining at most `max_samples` latency samples.
    pub fn with_capacity(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            spans_received: AtomicU64::new(0),
            spans_processed: AtomicU64::new(0),
            spans_dropped: AtomicU64::new(0),
            spans_exported: AtomicU64::new(0),
            export_errors: AtomicU64::new(0),
            processing_times: RwLock::new(VecDeque::with_capacity(max_samples)),
            max_samples,
        }
    }

    pub fn record_received(&self) {
        self.spans_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.spans_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.spans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exported(&self) {
        self.spans_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_export_error(&self) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one processing latency sample, evicting the oldest when full.
    pub fn record_processing_time(&self, elapsed: Duration) {
        let mut samples = self
            .processing_times
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// Number of latency samples currently retained.
    pub fn latency_sample_count(&self) -> usize {
        self.processing_times
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn latency_capacity(&self) -> usize {
        self.max_samples
    }

    /// Returns a point-in-time copy of all counters and latency percentiles.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sorted: Vec<Duration> = {
            let samples = self
                .processing_times
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            samples.iter().copied().collect()
        };
        sorted.sort_unstable();

        let (latency_p50, latency_p95, latency_p99) = if sorted.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            let len = sorted.len();
            (
                sorted[len / 2],
                sorted[rank(len, 0.95)],
                sorted[rank(len, 0.99)],
            )
        };

        MetricsSnapshot {
            spans_received: self.spans_received.load(Ordering::Relaxed),
            spans_processed: self.spans_processed.load(Ordering::Relaxed),
            spans_dropped: self.spans_dropped.load(Ordering::Relaxed),
            spans_exported: self.spans_exported.load(Ordering::Relaxed),
            export_errors: self.export_errors.load(Ordering::Relaxed),
            latency_p50,
            latency_p95,
            latency_p99,
        }
    }

    #[cfg(test)]
    fn latency_samples(&self) -> Vec<Duration> {
        self.processing_times
            .read()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }
}

/// Nearest-rank index, floored, never past the last element.
fn rank(len: usize, quantile: f64) -> usize {
    ((len as f64 * quantile) as usize).min(len - 1)
}

/// Immutable point-in-time view of the metrics engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub spans_received: u64,
    pub spans_processed: u64,
    pub spans_dropped: u64,
    pub spans_exported: u64,
    pub export_errors: u64,
    #[serde(rename = "latency_p50_ns", serialize_with = "as_nanos")]
    pub latency_p50: Duration,
    #[serde(rename = "latency_p95_ns", serialize_with = "as_nanos")]
    pub latency_p95: Duration,
    #[serde(rename = "latency_p99_ns", serialize_with = "as_nanos")]
    pub latency_p99: Duration,
}

impl MetricsSnapshot {
    /// Percentage of received spans that were dropped.
    pub fn drop_rate(&self) -> f64 {
        if self.spans_received == 0 {
            return 0.0;
        }
        self.spans_dropped as f64 / self.spans_received as f64 * 100.0
    }

    /// Export errors as a percentage of exported spans.
    pub fn error_rate(&self) -> f64 {
        if self.spans_exported == 0 {
            return 0.0;
        }
        self.export_errors as f64 / self.spans_exported as f64 * 100.0
    }
}

fn as_nanos<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_nanos().min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let m = PipelineMetrics::new();
        m.record_received();
        m.record_received();
        m.record_processed();
        m.record_dropped();
        m.record_exported();
        m.record_export_error();

        let s = m.snapshot();
        assert_eq!(s.spans_received, 2);
        assert_eq!(s.spans_processed, 1);
        assert_eq!(s.spans_dropped, 1);
        assert_eq!(s.spans_exported, 1);
        assert_eq!(s.export_errors, 1);
    }

    #[test]
    fn test_drop_rate() {
        let m = PipelineMetrics::new();
        for _ in 0..100 {
            m.record_received();
        }
        for _ in 0..5 {
            m.record_dropped();
        }
        assert!((m.snapshot().drop_rate() - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_drop_rate_matches_ratio() {
        for (n, d) in [(1u64, 0u64), (3, 1), (7, 7), (1000, 13)] {
            let m = PipelineMetrics::new();
            (0..n).for_each(|_| m.record_received());
            (0..d).for_each(|_| m.record_dropped());
            let expected = d as f64 / n as f64 * 100.0;
            assert!((m.snapshot().drop_rate() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_error_rate() {
        let m = PipelineMetrics::new();
        for _ in 0..50 {
            m.record_exported();
        }
        for _ in 0..2 {
            m.record_export_error();
        }
        assert!((m.snapshot().error_rate() - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_rates_zero_without_denominator() {
        let m = PipelineMetrics::new();
        m.record_dropped();
        m.record_export_error();
        let s = m.snapshot();
        assert_eq!(s.drop_rate(), 0.0);
        assert_eq!(s.error_rate(), 0.0);
    }

    #[test]
    fn test_latency_percentiles() {
        let m = PipelineMetrics::new();
        m.record_processing_time(Duration::from_millis(10));
        m.record_processing_time(Duration::from_millis(20));
        m.record_processing_time(Duration::from_millis(30));
        m.record_processing_time(Duration::from_millis(100));

        let s = m.snapshot();
        assert_eq!(s.latency_p50, Duration::from_millis(30));
        assert_eq!(s.latency_p95, Duration::from_millis(100));
        assert_eq!(s.latency_p99, Duration::from_millis(100));
        assert!(s.latency_p99 > s.latency_p50);
    }

    #[test]
    fn test_percentiles_use_floor_rank() {
        let m = PipelineMetrics::new();
        for i in 1..=100u64 {
            m.record_processing_time(Duration::from_millis(i));
        }
        let s = m.snapshot();
        // sorted[50], sorted[95], sorted[99]
        assert_eq!(s.latency_p50, Duration::from_millis(51));
        assert_eq!(s.latency_p95, Duration::from_millis(96));
        assert_eq!(s.latency_p99, Duration::from_millis(100));
    }

    #[test]
    fn test_empty_buffer_zero_percentiles() {
        let s = PipelineMetrics::new().snapshot();
        assert_eq!(s.latency_p50, Duration::ZERO);
        assert_eq!(s.latency_p95, Duration::ZERO);
        assert_eq!(s.latency_p99, Duration::ZERO);
    }

    #[test]
    fn test_buffer_rotation_evicts_oldest() {
        let m = PipelineMetrics::with_capacity(10);
        for i in 0..=10u64 {
            m.record_processing_time(Duration::from_millis(i));
        }

        let samples = m.latency_samples();
        assert_eq!(samples.len(), 10);
        assert!(!samples.contains(&Duration::ZERO));
        assert_eq!(samples.first(), Some(&Duration::from_millis(1)));
        assert_eq!(samples.last(), Some(&Duration::from_millis(10)));
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let m = PipelineMetrics::with_capacity(10);
        for i in 0..20u64 {
            m.record_processing_time(Duration::from_millis(i));
            assert!(m.latency_sample_count() <= 10);
        }
        assert_eq!(m.latency_capacity(), 10);
    }

    #[test]
    fn test_snapshot_does_not_mutate_buffer() {
        let m = PipelineMetrics::with_capacity(4);
        for ms in [40, 10, 30, 20] {
            m.record_processing_time(Duration::from_millis(ms));
        }
        let _ = m.snapshot();
        assert_eq!(
            m.latency_samples(),
            vec![
                Duration::from_millis(40),
                Duration::from_millis(10),
                Duration::from_millis(30),
                Duration::from_millis(20),
            ]
        );
    }

    #[test]
    fn test_concurrent_recording() {
        let m = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        m.record_received();
                        m.record_processing_time(Duration::from_micros(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(m.snapshot().spans_received, 8000);
        assert_eq!(m.latency_sample_count(), DEFAULT_LATENCY_SAMPLES);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let m = PipelineMetrics::new();
        m.record_received();
        m.record_processing_time(Duration::from_micros(5));
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["spans_received"], 1);
        assert_eq!(json["latency_p50_ns"], 5000);
    }
}

//! # Metrics and Monitoring
//!
//! Counters are plain atomics; latency means are maintained incrementally
//! (Welford) so no sample history is kept. Everything is process-lifetime:
//! there is no reset short of dropping the collector.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::MetricsConfig;
use crate::error::Error;
use crate::types::OperationKind;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Operation metrics
    reads: AtomicU64,
    writes: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,

    // Cache metrics
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Admission metrics
    overload_rejections: AtomicU64,
    timeouts: AtomicU64,

    // Physical write metrics
    physical_writes: AtomicU64,
    coalesced_chunks: AtomicU64,

    read_latency: Mutex<RunningStats>,
    write_latency: Mutex<RunningStats>,
}

/// Welford running mean and variance
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully completed operation
    pub fn record_completion(&self, kind: OperationKind, bytes: u64, latency: Duration) {
        let micros = latency.as_secs_f64() * 1_000_000.0;
        match kind {
            OperationKind::Read => {
                self.inner.reads.fetch_add(1, Ordering::Relaxed);
                self.inner.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                self.inner.read_latency.lock().push(micros);
            }
            OperationKind::Write => {
                self.inner.writes.fetch_add(1, Ordering::Relaxed);
                self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                self.inner.write_latency.lock().push(micros);
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self, kind: OperationKind, error: &Error) {
        match kind {
            OperationKind::Read => self.inner.read_failures.fetch_add(1, Ordering::Relaxed),
            OperationKind::Write => self.inner.write_failures.fetch_add(1, Ordering::Relaxed),
        };
        match error {
            Error::Overloaded { .. } => {
                self.inner.overload_rejections.fetch_add(1, Ordering::Relaxed);
            }
            Error::Timeout { .. } => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one physical write that carried `chunks` logical writes
    pub fn record_physical_write(&self, chunks: u64) {
        self.inner.physical_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.coalesced_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let read_latency = *self.inner.read_latency.lock();
        let write_latency = *self.inner.write_latency.lock();
        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        MetricsSnapshot {
            reads: self.inner.reads.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            read_failures: self.inner.read_failures.load(Ordering::Relaxed),
            write_failures: self.inner.write_failures.load(Ordering::Relaxed),
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups > 0 {
                cache_hits as f64 / lookups as f64
            } else {
                0.0
            },
            mean_read_latency_ms: read_latency.mean() / 1000.0,
            mean_write_latency_ms: write_latency.mean() / 1000.0,
            read_latency_stddev_ms: read_latency.stddev() / 1000.0,
            write_latency_stddev_ms: write_latency.stddev() / 1000.0,
            overload_rejections: self.inner.overload_rejections.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            physical_writes: self.inner.physical_writes.load(Ordering::Relaxed),
            coalesced_chunks: self.inner.coalesced_chunks.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub mean_read_latency_ms: f64,
    pub mean_write_latency_ms: f64,
    pub read_latency_stddev_ms: f64,
    pub write_latency_stddev_ms: f64,
    pub overload_rejections: u64,
    pub timeouts: u64,
    pub physical_writes: u64,
    pub coalesced_chunks: u64,
}

impl MetricsSnapshot {
    /// Mean latencies above their configured thresholds. Reads and writes are
    /// judged independently, and only once at least one sample exists.
    pub fn latency_alerts(&self, config: &MetricsConfig) -> Vec<LatencyAlert> {
        let mut alerts = Vec::new();
        if self.reads > 0 && self.mean_read_latency_ms > config.read_latency_warn_ms {
            alerts.push(LatencyAlert {
                kind: OperationKind::Read,
                mean_ms: self.mean_read_latency_ms,
                threshold_ms: config.read_latency_warn_ms,
            });
        }
        if self.writes > 0 && self.mean_write_latency_ms > config.write_latency_warn_ms {
            alerts.push(LatencyAlert {
                kind: OperationKind::Write,
                mean_ms: self.mean_write_latency_ms,
                threshold_ms: config.write_latency_warn_ms,
            });
        }
        alerts
    }
}

/// Mean latency threshold crossing
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyAlert {
    pub kind: OperationKind,
    pub mean_ms: f64,
    pub threshold_ms: f64,
}

impl fmt::Display for LatencyAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mean {} latency {:.2}ms exceeds {:.2}ms",
            self.kind, self.mean_ms, self.threshold_ms
        )
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Start new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer, log and return the duration
    pub fn stop(self) -> Duration {
        let duration = self.elapsed();
        tracing::trace!(
            name = self.name,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_matches_direct_mean() {
        let samples = [4.0, 7.0, 13.0, 16.0];
        let mut stats = RunningStats::default();
        for s in samples {
            stats.push(s);
        }
        assert_eq!(stats.count(), 4);
        assert!((stats.mean() - 10.0).abs() < 1e-9);
        // population variance of the samples is 22.5
        assert!((stats.stddev() - 22.5f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_and_counters() {
        let metrics = Metrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_completion(OperationKind::Read, 100, Duration::from_millis(2));
        metrics.record_completion(OperationKind::Write, 50, Duration::from_millis(4));
        metrics.record_physical_write(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.bytes_written, 50);
        assert!((snap.cache_hit_rate - 0.75).abs() < 1e-9);
        assert!((snap.mean_read_latency_ms - 2.0).abs() < 1e-6);
        assert_eq!(snap.physical_writes, 1);
        assert_eq!(snap.coalesced_chunks, 3);
    }

    #[test]
    fn test_failures_classified() {
        let metrics = Metrics::new();
        metrics.record_failure(
            OperationKind::Write,
            &Error::Overloaded {
                queue: "write",
                depth: 1,
                in_flight: 1,
            },
        );
        metrics.record_failure(OperationKind::Read, &Error::Timeout { waited_ms: 10 });
        metrics.record_failure(OperationKind::Read, &Error::internal("x"));

        let snap = metrics.snapshot();
        assert_eq!(snap.write_failures, 1);
        assert_eq!(snap.read_failures, 2);
        assert_eq!(snap.overload_rejections, 1);
        assert_eq!(snap.timeouts, 1);
    }

    #[test]
    fn test_latency_alerts_independent() {
        let metrics = Metrics::new();
        metrics.record_completion(OperationKind::Read, 1, Duration::from_millis(80));
        metrics.record_completion(OperationKind::Write, 1, Duration::from_millis(10));

        let config = MetricsConfig {
            read_latency_warn_ms: 50.0,
            write_latency_warn_ms: 50.0,
            ..MetricsConfig::default()
        };
        let alerts = metrics.snapshot().latency_alerts(&config);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, OperationKind::Read);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

use super::histogram::{percentile_from_counts, LatencyHistogram};
use super::{LatencyStats, Metrics, TransferDirection};

// ─── StreamCollector ─────────────────────────────────────────────

/// Per-sub-stream accumulator for bytes, packets, latency, and jitter.
///
/// Byte and packet recording is wait-free (atomic adds); latency
/// recording serializes on one small scalar lock so the jitter chain
/// (consecutive-sample deltas) stays ordered.
pub struct StreamCollector {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    histogram: LatencyHistogram,
    scalars: Mutex<LatencyScalars>,
    start_time: Mutex<Instant>,
}

/// Scalar latency accumulators guarded together so a reader sees a
/// mutually consistent (min, max, sum, count, jitter) tuple.
#[derive(Debug, Clone, Copy)]
struct LatencyScalars {
    min_ms: f64,
    max_ms: f64,
    sum_ms: f64,
    count: u64,
    jitter_sum_ms: f64,
    jitter_count: u64,
    last_sample_ms: Option<f64>,
}

impl LatencyScalars {
    fn zeroed() -> Self {
        Self {
            min_ms: 0.0,
            max_ms: 0.0,
            sum_ms: 0.0,
            count: 0,
            jitter_sum_ms: 0.0,
            jitter_count: 0,
            last_sample_ms: None,
        }
    }
}

/// One consistent latency snapshot handed to the aggregator alongside
/// the bucket counts it wrote into the caller's scratch buffer.
#[derive(Debug, Clone, Copy)]
pub struct LatencySnapshot {
    pub overflow: u32,
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub sum_ms: f64,
    pub jitter_sum_ms: f64,
    pub jitter_count: u64,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::with_histogram(LatencyHistogram::new())
    }

    pub fn with_histogram(histogram: LatencyHistogram) -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            histogram,
            scalars: Mutex::new(LatencyScalars::zeroed()),
            start_time: Mutex::new(Instant::now()),
        }
    }

    // ── Write side ──────────────────────────────────────────────

    pub fn record_bytes(&self, n: u64, direction: TransferDirection) {
        match direction {
            TransferDirection::Sent => self.bytes_sent.fetch_add(n, Ordering::Relaxed),
            TransferDirection::Received => self.bytes_received.fetch_add(n, Ordering::Relaxed),
        };
    }

    pub fn record_packet(&self, direction: TransferDirection) {
        match direction {
            TransferDirection::Sent => self.packets_sent.fetch_add(1, Ordering::Relaxed),
            TransferDirection::Received => self.packets_received.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record one latency observation in milliseconds. From the second
    /// sample on, the absolute delta to the previous sample feeds the
    /// jitter average.
    pub fn record_latency(&self, sample_ms: f64) {
        self.histogram.record(sample_ms);

        let mut s = self.scalars.lock();
        if s.count == 0 || sample_ms < s.min_ms {
            s.min_ms = sample_ms;
        }
        if s.count == 0 || sample_ms > s.max_ms {
            s.max_ms = sample_ms;
        }
        s.sum_ms += sample_ms;
        s.count += 1;

        if let Some(prev) = s.last_sample_ms {
            s.jitter_sum_ms += (sample_ms - prev).abs();
            s.jitter_count += 1;
        }
        s.last_sample_ms = Some(sample_ms);
    }

    /// Zero everything and restart the throughput clock. Takes the
    /// scalar lock so the histogram reset cannot interleave with a
    /// latency writer.
    pub fn reset(&self) {
        let mut s = self.scalars.lock();
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.histogram.reset();
        *s = LatencyScalars::zeroed();
        *self.start_time.lock() = Instant::now();
    }

    // ── Read side ───────────────────────────────────────────────

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.lock().elapsed()
    }

    pub fn bucket_count(&self) -> usize {
        self.histogram.bucket_count()
    }

    pub fn bucket_width_ms(&self) -> f64 {
        self.histogram.bucket_width_ms()
    }

    /// Fill `scratch` with the bucket counts and return the scalar
    /// snapshot taken under the same lock.
    pub fn snapshot_latency(&self, scratch: &mut [u32]) -> LatencySnapshot {
        let s = self.scalars.lock();
        let overflow = self.histogram.copy_to(scratch);
        LatencySnapshot {
            overflow,
            count: s.count,
            min_ms: s.min_ms,
            max_ms: s.max_ms,
            sum_ms: s.sum_ms,
            jitter_sum_ms: s.jitter_sum_ms,
            jitter_count: s.jitter_count,
        }
    }

    /// Full metrics snapshot for single-collector use (the aggregator
    /// builds merged snapshots itself).
    pub fn metrics(&self) -> Metrics {
        let mut scratch = vec![0u32; self.histogram.bucket_count()];
        let snap = self.snapshot_latency(&mut scratch);

        let width = self.histogram.bucket_width_ms();
        let latency = LatencyStats {
            min_ms: snap.min_ms,
            max_ms: snap.max_ms,
            avg_ms: if snap.count > 0 {
                snap.sum_ms / snap.count as f64
            } else {
                0.0
            },
            p50_ms: percentile_from_counts(&scratch, width, snap.max_ms, snap.count, 0.50),
            p95_ms: percentile_from_counts(&scratch, width, snap.max_ms, snap.count, 0.95),
            p99_ms: percentile_from_counts(&scratch, width, snap.max_ms, snap.count, 0.99),
            count: snap.count,
        };

        let bytes = self.bytes_sent() + self.bytes_received();
        let elapsed = self.elapsed().as_secs_f64().max(1e-9);
        let mbps = bytes as f64 * 8.0 / elapsed / 1e6;

        Metrics {
            throughput_mbps: mbps,
            throughput_avg_mbps: mbps,
            latency_ms: latency,
            rtt: None,
            jitter_ms: if snap.jitter_count > 0 {
                snap.jitter_sum_ms / snap.jitter_count as f64
            } else {
                0.0
            },
            packet_loss_percent: 0.0,
            bytes_transferred: bytes,
            packets_sent: self.packets_sent(),
            packets_received: self.packets_received(),
            timestamp: Utc::now(),
            stream_count: 1,
        }
    }
}

impl Default for StreamCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_and_packet_counters_accumulate() {
        let c = StreamCollector::new();
        c.record_bytes(100, TransferDirection::Sent);
        c.record_bytes(50, TransferDirection::Sent);
        c.record_bytes(10, TransferDirection::Received);
        c.record_packet(TransferDirection::Sent);
        c.record_packet(TransferDirection::Received);
        c.record_packet(TransferDirection::Received);

        assert_eq!(c.bytes_sent(), 150);
        assert_eq!(c.bytes_received(), 10);
        assert_eq!(c.packets_sent(), 1);
        assert_eq!(c.packets_received(), 2);
    }

    #[test]
    fn jitter_is_mean_absolute_consecutive_delta() {
        let c = StreamCollector::new();
        c.record_latency(10.0);
        c.record_latency(14.0); // |14-10| = 4
        c.record_latency(11.0); // |11-14| = 3

        let mut scratch = vec![0u32; c.bucket_count()];
        let snap = c.snapshot_latency(&mut scratch);

        assert_eq!(snap.count, 3);
        assert_eq!(snap.jitter_count, 2);
        assert!((snap.jitter_sum_ms - 7.0).abs() < 1e-9);

        let m = c.metrics();
        assert!((m.jitter_ms - 3.5).abs() < 1e-9);
    }

    #[test]
    fn single_sample_has_no_jitter() {
        let c = StreamCollector::new();
        c.record_latency(25.0);
        assert_eq!(c.metrics().jitter_ms, 0.0);
    }

    #[test]
    fn min_max_avg_track_samples() {
        let c = StreamCollector::new();
        c.record_latency(5.0);
        c.record_latency(15.0);
        c.record_latency(10.0);

        let m = c.metrics();
        assert_eq!(m.latency_ms.min_ms, 5.0);
        assert_eq!(m.latency_ms.max_ms, 15.0);
        assert!((m.latency_ms.avg_ms - 10.0).abs() < 1e-9);
        assert_eq!(m.latency_ms.count, 3);
    }

    #[test]
    fn reset_clears_counters_and_latency() {
        let c = StreamCollector::new();
        c.record_bytes(4096, TransferDirection::Received);
        c.record_latency(20.0);
        c.reset();

        assert_eq!(c.bytes_received(), 0);
        let m = c.metrics();
        assert_eq!(m.latency_ms.count, 0);
        assert_eq!(m.bytes_transferred, 0);
        assert_eq!(m.jitter_ms, 0.0);
    }
}

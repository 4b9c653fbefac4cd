use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

use super::histogram::{percentile_from_counts, LatencyHistogram};
use super::{LatencyStats, Metrics, StreamCollector};

// ─── MultiStreamAggregator ───────────────────────────────────────

/// Fans N per-sub-stream collectors into one merged metrics snapshot.
///
/// The merge walks every collector, copies its bucket counts into a
/// shared scratch buffer, and accumulates them element-wise — so a
/// snapshot costs O(N × bucket_count) and never touches individual
/// samples.
pub struct MultiStreamAggregator {
    collectors: Vec<Arc<StreamCollector>>,
    next: AtomicUsize,
    merge: Mutex<MergeBuffers>,
    start_time: Mutex<Instant>,
    bucket_width_ms: f64,
}

/// Scratch space reused across snapshots; guarded by the merge lock
/// for the whole of `aggregated_metrics`.
struct MergeBuffers {
    bucket_counts: Vec<u64>,
    scratch: Vec<u32>,
}

impl MultiStreamAggregator {
    pub fn new(stream_count: usize) -> Self {
        Self::with_histogram_config(
            stream_count,
            super::histogram::DEFAULT_BUCKET_WIDTH_MS,
            super::histogram::DEFAULT_BUCKET_COUNT,
        )
    }

    pub fn with_histogram_config(
        stream_count: usize,
        bucket_width_ms: f64,
        bucket_count: usize,
    ) -> Self {
        assert!(stream_count > 0, "aggregator needs at least one collector");

        let collectors = (0..stream_count)
            .map(|_| {
                Arc::new(StreamCollector::with_histogram(
                    LatencyHistogram::with_config(bucket_width_ms, bucket_count),
                ))
            })
            .collect();

        Self {
            collectors,
            next: AtomicUsize::new(0),
            merge: Mutex::new(MergeBuffers {
                bucket_counts: vec![0u64; bucket_count],
                scratch: vec![0u32; bucket_count],
            }),
            start_time: Mutex::new(Instant::now()),
            bucket_width_ms,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.collectors.len()
    }

    /// Pin sub-stream `i` to its own collector.
    pub fn collector(&self, i: usize) -> Arc<StreamCollector> {
        Arc::clone(&self.collectors[i])
    }

    /// Round-robin a collector for producers that did not pick one.
    pub fn dispatch(&self) -> Arc<StreamCollector> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.collectors.len();
        Arc::clone(&self.collectors[i])
    }

    /// Reset every member collector and restart the aggregation clock.
    /// Called once, at the warm-up → measurement transition.
    pub fn reset(&self) {
        for c in &self.collectors {
            c.reset();
        }
        *self.start_time.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.lock().elapsed()
    }

    pub fn total_bytes(&self) -> u64 {
        self.collectors
            .iter()
            .map(|c| c.bytes_sent() + c.bytes_received())
            .sum()
    }

    /// Merge all collectors into one snapshot: counters summed,
    /// histograms merged bucket-wise, percentiles computed on the
    /// merged buckets.
    pub fn aggregated_metrics(&self) -> Metrics {
        let mut merge = self.merge.lock();
        let MergeBuffers {
            bucket_counts,
            scratch,
        } = &mut *merge;
        bucket_counts.iter_mut().for_each(|b| *b = 0);

        let mut bytes_sent = 0u64;
        let mut bytes_received = 0u64;
        let mut packets_sent = 0u64;
        let mut packets_received = 0u64;
        let mut count = 0u64;
        let mut sum_ms = 0.0f64;
        let mut jitter_sum_ms = 0.0f64;
        let mut jitter_count = 0u64;
        let mut min_ms = f64::MAX;
        let mut max_ms = 0.0f64;

        for c in &self.collectors {
            bytes_sent += c.bytes_sent();
            bytes_received += c.bytes_received();
            packets_sent += c.packets_sent();
            packets_received += c.packets_received();

            let snap = c.snapshot_latency(scratch);
            for (merged, &raw) in bucket_counts.iter_mut().zip(scratch.iter()) {
                *merged += raw as u64;
            }

            if snap.count > 0 {
                min_ms = min_ms.min(snap.min_ms);
                max_ms = max_ms.max(snap.max_ms);
                count += snap.count;
                sum_ms += snap.sum_ms;
            }
            jitter_sum_ms += snap.jitter_sum_ms;
            jitter_count += snap.jitter_count;
        }

        if count == 0 {
            min_ms = 0.0;
        }

        let width = self.bucket_width_ms;
        let latency = LatencyStats {
            min_ms,
            max_ms,
            avg_ms: if count > 0 { sum_ms / count as f64 } else { 0.0 },
            p50_ms: percentile_from_counts(bucket_counts, width, max_ms, count, 0.50),
            p95_ms: percentile_from_counts(bucket_counts, width, max_ms, count, 0.95),
            p99_ms: percentile_from_counts(bucket_counts, width, max_ms, count, 0.99),
            count,
        };

        let total_bytes = bytes_sent + bytes_received;
        let elapsed = self.elapsed().as_secs_f64().max(1e-9);
        let mbps = total_bytes as f64 * 8.0 / elapsed / 1e6;

        Metrics {
            throughput_mbps: mbps,
            throughput_avg_mbps: mbps,
            latency_ms: latency,
            rtt: None,
            jitter_ms: if jitter_count > 0 {
                jitter_sum_ms / jitter_count as f64
            } else {
                0.0
            },
            packet_loss_percent: 0.0,
            bytes_transferred: total_bytes,
            packets_sent,
            packets_received,
            timestamp: Utc::now(),
            stream_count: self.collectors.len() as u32,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TransferDirection;

    #[test]
    fn counters_sum_across_collectors() {
        let agg = MultiStreamAggregator::new(3);
        agg.collector(0).record_bytes(100, TransferDirection::Sent);
        agg.collector(1).record_bytes(200, TransferDirection::Received);
        agg.collector(2).record_bytes(300, TransferDirection::Sent);
        agg.collector(2).record_packet(TransferDirection::Sent);

        let m = agg.aggregated_metrics();
        assert_eq!(m.bytes_transferred, 600);
        assert_eq!(m.packets_sent, 1);
        assert_eq!(m.stream_count, 3);
    }

    #[test]
    fn global_min_max_span_collectors_with_samples() {
        let agg = MultiStreamAggregator::new(3);
        agg.collector(0).record_latency(10.0);
        agg.collector(1).record_latency(50.0);
        // collector 2 stays empty and must not drag min to 0

        let m = agg.aggregated_metrics();
        assert_eq!(m.latency_ms.min_ms, 10.0);
        assert_eq!(m.latency_ms.max_ms, 50.0);
        assert_eq!(m.latency_ms.count, 2);
    }

    #[test]
    fn merged_percentiles_are_ordered() {
        let agg = MultiStreamAggregator::new(4);
        for i in 0..4 {
            let c = agg.collector(i);
            for k in 0..250 {
                c.record_latency(((i * 250 + k) % 300) as f64);
            }
        }

        let m = agg.aggregated_metrics();
        assert!(m.latency_ms.p50_ms <= m.latency_ms.p95_ms);
        assert!(m.latency_ms.p95_ms <= m.latency_ms.p99_ms);
        // percentiles report bucket upper edges, so the ceiling is one
        // bucket width past the largest sample
        assert!(m.latency_ms.p99_ms <= 300.0);
    }

    #[test]
    fn global_jitter_merges_sums_and_counts() {
        let agg = MultiStreamAggregator::new(2);
        let a = agg.collector(0);
        a.record_latency(10.0);
        a.record_latency(20.0); // delta 10, one interval
        let b = agg.collector(1);
        b.record_latency(5.0);
        b.record_latency(11.0); // delta 6, one interval

        let m = agg.aggregated_metrics();
        assert!((m.jitter_ms - 8.0).abs() < 1e-9);
    }

    #[test]
    fn dispatch_round_robins_members() {
        let agg = MultiStreamAggregator::new(2);
        agg.dispatch().record_bytes(1, TransferDirection::Sent);
        agg.dispatch().record_bytes(1, TransferDirection::Sent);
        agg.dispatch().record_bytes(1, TransferDirection::Sent);

        assert_eq!(agg.collector(0).bytes_sent(), 2);
        assert_eq!(agg.collector(1).bytes_sent(), 1);
    }

    #[test]
    fn reset_zeroes_members_and_clock() {
        let agg = MultiStreamAggregator::new(2);
        agg.collector(0).record_bytes(4096, TransferDirection::Sent);
        agg.collector(1).record_latency(12.0);
        agg.reset();

        let m = agg.aggregated_metrics();
        assert_eq!(m.bytes_transferred, 0);
        assert_eq!(m.latency_ms.count, 0);
    }
}

use std::sync::atomic::{AtomicU32, Ordering};

// ─── Configuration ───────────────────────────────────────────────

/// Default width of one latency bucket (ms).
pub const DEFAULT_BUCKET_WIDTH_MS: f64 = 1.0;

/// Default number of buckets — covers 0..2000 ms at 1 ms resolution.
/// A snapshot walks every bucket, so this bounds snapshot cost at
/// O(bucket_count) regardless of how many samples were recorded.
pub const DEFAULT_BUCKET_COUNT: usize = 2000;

// ─── LatencyHistogram ────────────────────────────────────────────

/// Fixed-width bucketed latency counter with an overflow bucket.
///
/// `record()` is safe under concurrent writers (per-bucket atomic
/// increments). Readers take a snapshot with `copy_to()` into a
/// caller-provided buffer; a snapshot racing a writer may miss the
/// writer's in-flight sample but never observes torn counts.
pub struct LatencyHistogram {
    bucket_width_ms: f64,
    buckets: Box<[AtomicU32]>,
    overflow: AtomicU32,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUCKET_WIDTH_MS, DEFAULT_BUCKET_COUNT)
    }

    pub fn with_config(bucket_width_ms: f64, bucket_count: usize) -> Self {
        assert!(bucket_width_ms > 0.0, "bucket width must be positive");
        assert!(bucket_count > 0, "bucket count must be positive");

        let buckets = (0..bucket_count)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            bucket_width_ms,
            buckets,
            overflow: AtomicU32::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_width_ms(&self) -> f64 {
        self.bucket_width_ms
    }

    /// Record one latency sample in milliseconds.
    /// Negative samples clamp to bucket zero; samples past the last
    /// bucket land in `overflow`.
    pub fn record(&self, sample_ms: f64) {
        let idx = (sample_ms.max(0.0) / self.bucket_width_ms) as usize;
        match self.buckets.get(idx) {
            Some(bucket) => {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Copy bucket counters into `dst` and return the overflow count.
    /// `dst` must hold at least `bucket_count()` entries.
    pub fn copy_to(&self, dst: &mut [u32]) -> u32 {
        debug_assert!(dst.len() >= self.buckets.len());
        for (slot, bucket) in dst.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        self.overflow.load(Ordering::Relaxed)
    }

    /// Zero every bucket and the overflow counter. A concurrent reader
    /// observes each bucket either pre- or post-reset; callers that need
    /// a hard boundary (the warm-up transition) serialize around this
    /// with the owning collector's scalar lock.
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
        self.overflow.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Percentile from bucket counts ───────────────────────────────

/// Compute a percentile from bucketed counts.
///
/// With total count `n` and fraction `r`, the target rank is
/// `⌊n·r⌋ + 1`; the answer is the upper edge `(i+1)·width` of the first
/// bucket whose prefix sum reaches the target. If the buckets run out
/// (the rank fell into overflow), the observed `max_ms` is returned.
pub fn percentile_from_counts<C>(
    counts: &[C],
    bucket_width_ms: f64,
    max_ms: f64,
    total: u64,
    r: f64,
) -> f64
where
    C: Into<u64> + Copy,
{
    if total == 0 {
        return 0.0;
    }

    let target = ((total as f64) * r) as u64 + 1;
    let mut running = 0u64;
    for (i, &count) in counts.iter().enumerate() {
        running += count.into();
        if running >= target {
            return (i as f64 + 1.0) * bucket_width_ms;
        }
    }

    max_ms
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_by_floor_of_width() {
        let hist = LatencyHistogram::with_config(1.0, 10);
        hist.record(0.0);
        hist.record(0.9);
        hist.record(1.0);
        hist.record(9.9);

        let mut counts = vec![0u32; 10];
        let overflow = hist.copy_to(&mut counts);

        assert_eq!(counts[0], 2);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[9], 1);
        assert_eq!(overflow, 0);
    }

    #[test]
    fn out_of_range_sample_only_increments_overflow() {
        let hist = LatencyHistogram::with_config(1.0, 10);
        hist.record(10.0);
        hist.record(250.0);

        let mut counts = vec![0u32; 10];
        let overflow = hist.copy_to(&mut counts);

        assert!(counts.iter().all(|&c| c == 0));
        assert_eq!(overflow, 2);
    }

    #[test]
    fn negative_sample_clamps_to_bucket_zero() {
        let hist = LatencyHistogram::with_config(1.0, 10);
        hist.record(-3.0);

        let mut counts = vec![0u32; 10];
        hist.copy_to(&mut counts);
        assert_eq!(counts[0], 1);
    }

    #[test]
    fn counts_are_conserved() {
        let hist = LatencyHistogram::with_config(2.0, 50);
        for i in 0..500 {
            hist.record(i as f64 * 0.37);
        }

        let mut counts = vec![0u32; 50];
        let overflow = hist.copy_to(&mut counts);
        let total: u64 = counts.iter().map(|&c| c as u64).sum::<u64>() + overflow as u64;
        assert_eq!(total, 500);
    }

    #[test]
    fn record_copy_reset_record_round_trips() {
        let hist = LatencyHistogram::with_config(1.0, 20);
        hist.record(5.5);
        hist.record(12.0);
        hist.record(999.0);

        let mut first = vec![0u32; 20];
        let first_overflow = hist.copy_to(&mut first);

        hist.reset();
        hist.record(5.5);
        hist.record(12.0);
        hist.record(999.0);

        let mut second = vec![0u32; 20];
        let second_overflow = hist.copy_to(&mut second);

        assert_eq!(first, second);
        assert_eq!(first_overflow, second_overflow);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let hist = LatencyHistogram::new();
        for i in 0..1000 {
            hist.record((i % 200) as f64);
        }

        let mut counts = vec![0u32; hist.bucket_count()];
        hist.copy_to(&mut counts);

        let p50 = percentile_from_counts(&counts, 1.0, 200.0, 1000, 0.50);
        let p95 = percentile_from_counts(&counts, 1.0, 200.0, 1000, 0.95);
        let p99 = percentile_from_counts(&counts, 1.0, 200.0, 1000, 0.99);

        assert!(p50 <= p95);
        assert!(p95 <= p99);
        assert!(p99 <= 200.0);
    }

    #[test]
    fn percentile_falls_back_to_max_when_rank_is_in_overflow() {
        let hist = LatencyHistogram::with_config(1.0, 10);
        for _ in 0..10 {
            hist.record(5.0);
        }
        for _ in 0..90 {
            hist.record(5000.0);
        }

        let mut counts = vec![0u32; 10];
        hist.copy_to(&mut counts);

        let p99 = percentile_from_counts(&counts, 1.0, 5000.0, 100, 0.99);
        assert_eq!(p99, 5000.0);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let counts = vec![0u32; 10];
        assert_eq!(percentile_from_counts(&counts, 1.0, 0.0, 0, 0.5), 0.0);
    }
}

use parking_lot::Mutex;

use super::RttStats;

/// Default number of RTT samples kept in the ring.
pub const DEFAULT_RTT_CAPACITY: usize = 100;

// ─── RttCollector ────────────────────────────────────────────────

/// Fixed-size circular buffer of round-trip-time samples (ms) plus an
/// unloaded baseline. Old samples fall off the back so the stats track
/// the recent window rather than the whole session.
pub struct RttCollector {
    inner: Mutex<Ring>,
}

struct Ring {
    samples: Vec<f64>,
    head: usize,
    len: usize,
    current_ms: f64,
    baseline_ms: f64,
}

impl RttCollector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RTT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "rtt ring needs capacity");
        Self {
            inner: Mutex::new(Ring {
                samples: vec![0.0; capacity],
                head: 0,
                len: 0,
                current_ms: 0.0,
                baseline_ms: 0.0,
            }),
        }
    }

    /// Record one RTT sample. The first sample also becomes the
    /// baseline unless one was set explicitly.
    pub fn record(&self, sample_ms: f64) {
        let mut ring = self.inner.lock();
        if ring.baseline_ms == 0.0 {
            ring.baseline_ms = sample_ms;
        }
        let head = ring.head;
        let cap = ring.samples.len();
        ring.samples[head] = sample_ms;
        ring.head = (head + 1) % cap;
        ring.len = (ring.len + 1).min(cap);
        ring.current_ms = sample_ms;
    }

    /// Pin the unloaded baseline (e.g. from a pre-test ping).
    pub fn set_baseline(&self, baseline_ms: f64) {
        self.inner.lock().baseline_ms = baseline_ms;
    }

    pub fn stats(&self) -> RttStats {
        let ring = self.inner.lock();
        if ring.len == 0 {
            return RttStats::default();
        }

        let window = &ring.samples[..ring.len];
        let mut min = f64::MAX;
        let mut max = 0.0f64;
        let mut sum = 0.0f64;
        for &s in window {
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        let avg = sum / ring.len as f64;

        // Jitter as population standard deviation over the window.
        let variance =
            window.iter().map(|&s| (s - avg) * (s - avg)).sum::<f64>() / ring.len as f64;

        RttStats {
            min_ms: min,
            max_ms: max,
            avg_ms: avg,
            current_ms: ring.current_ms,
            jitter_ms: variance.sqrt(),
            baseline_ms: ring.baseline_ms,
            count: ring.len as u64,
        }
    }
}

impl Default for RttCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────

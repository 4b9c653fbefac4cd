pub mod aggregator;
pub mod collector;
pub mod histogram;
pub mod rtt;

pub use aggregator::MultiStreamAggregator;
pub use collector::{LatencySnapshot, StreamCollector};
pub use histogram::LatencyHistogram;
pub use rtt::RttCollector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way bytes moved, from the measuring side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sent,
    Received,
}

/// Latency percentile block carried inside every metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub count: u64,
}

/// Round-trip-time block: the latency fields plus the unloaded baseline
/// and a standard-deviation jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub current_ms: f64,
    pub jitter_ms: f64,
    pub baseline_ms: f64,
    pub count: u64,
}

/// The metrics snapshot shape shared by broadcast frames, the complete
/// request, and the persisted results envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub throughput_mbps: f64,
    pub throughput_avg_mbps: f64,
    pub latency_ms: LatencyStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<RttStats>,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub bytes_transferred: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub timestamp: DateTime<Utc>,
    pub stream_count: u32,
}

impl Metrics {
    /// All-zero snapshot stamped now; used before any samples exist.
    pub fn empty(stream_count: u32) -> Self {
        Self {
            throughput_mbps: 0.0,
            throughput_avg_mbps: 0.0,
            latency_ms: LatencyStats::default(),
            rtt: None,
            jitter_ms: 0.0,
            packet_loss_percent: 0.0,
            bytes_transferred: 0,
            packets_sent: 0,
            packets_received: 0,
            timestamp: Utc::now(),
            stream_count,
        }
    }
}

pub mod http;
pub mod socket;

pub use http::HttpEngine;
pub use socket::SocketEngine;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::EngineResult;
use crate::metrics::Metrics;
use crate::stream::{Direction, Protocol, StreamConfig};

// ─── Timing discipline ───────────────────────────────────────────

/// Dial timeout for data-plane connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-call read/write deadline. A timeout is not an error; it is the
/// tick on which cancellation and the session deadline get observed.
pub const IO_TIMEOUT: Duration = Duration::from_secs(1);
pub const IO_TIMEOUT_BIDIRECTIONAL: Duration = Duration::from_millis(500);

/// Minimum spacing between latency samples per sub-stream, so
/// high-rate I/O does not overweight the latency statistics.
pub const LATENCY_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Kernel socket buffer size requested on data-plane sockets.
pub const SOCKET_BUFFER_BYTES: usize = 256 * 1024;

/// Stagger between HTTP sub-stream starts, to decorrelate slow-start.
pub const DEFAULT_STREAM_DELAY: Duration = Duration::from_millis(200);

// ─── EngineConfig ────────────────────────────────────────────────

/// Everything an engine needs to execute one session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub protocol: Protocol,
    pub direction: Direction,
    pub duration: Duration,
    pub warm_up: Duration,
    pub stream_count: usize,
    /// Datagram / record granularity for tcp/udp.
    pub packet_size: usize,
    /// Transfer chunk hint for http.
    pub chunk_size: usize,
    /// `host:port` for the socket engine, base URL for the HTTP engine.
    pub target: String,
    pub auth_token: Option<String>,
    /// Latency histogram shape; a deployment knob, not a client one.
    pub bucket_count: usize,
    pub bucket_width_ms: f64,
}

impl EngineConfig {
    pub fn from_stream_config(config: &StreamConfig, target: String) -> Self {
        Self {
            protocol: config.protocol,
            direction: config.direction,
            duration: Duration::from_secs(config.duration),
            warm_up: Duration::from_secs(config.warm_up),
            stream_count: config.streams as usize,
            packet_size: config.packet_size.unwrap_or(1400),
            chunk_size: config.chunk_size.unwrap_or(256 * 1024),
            target,
            auth_token: None,
            bucket_count: crate::metrics::histogram::DEFAULT_BUCKET_COUNT,
            bucket_width_ms: crate::metrics::histogram::DEFAULT_BUCKET_WIDTH_MS,
        }
    }

    pub fn total_window(&self) -> Duration {
        self.warm_up + self.duration
    }
}

// ─── WarmupGate ──────────────────────────────────────────────────

/// Where a byte landed relative to the warm-up boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteWindow {
    /// Inside warm-up: counted into the disposable grace counter only.
    Grace,
    /// The first byte after warm-up; the caller must reset the
    /// aggregator before recording it.
    First,
    /// Inside the measurement window.
    Measured,
}

/// Warm-up discipline shared by both engines. Bytes seen before
/// `grace_until` accumulate in a throwaway counter; exactly one caller
/// wins the compare-and-swap into the measurement window and performs
/// the aggregate reset that anchors `measure_start`.
pub struct WarmupGate {
    grace_until: Instant,
    grace_bytes: AtomicU64,
    measuring: AtomicBool,
}

impl WarmupGate {
    pub fn new(warm_up: Duration) -> Self {
        Self {
            grace_until: Instant::now() + warm_up,
            grace_bytes: AtomicU64::new(0),
            measuring: AtomicBool::new(false),
        }
    }

    /// Classify `n` freshly transferred bytes.
    pub fn on_bytes(&self, n: u64) -> ByteWindow {
        if self.measuring.load(Ordering::Acquire) {
            return ByteWindow::Measured;
        }
        if Instant::now() < self.grace_until {
            self.grace_bytes.fetch_add(n, Ordering::Relaxed);
            return ByteWindow::Grace;
        }
        if self
            .measuring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            ByteWindow::First
        } else {
            ByteWindow::Measured
        }
    }

    /// True once the measurement window is open; latency samples taken
    /// earlier are discarded by callers.
    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::Acquire)
    }

    pub fn grace_bytes(&self) -> u64 {
        self.grace_bytes.load(Ordering::Relaxed)
    }
}

// ─── Engine selection ────────────────────────────────────────────

/// The two data-plane engines share one capability set: run to
/// completion under a cancel flag, expose a live metrics snapshot,
/// report liveness. Selection is by protocol tag at session start.
pub enum AnyEngine {
    Socket(SocketEngine),
    Http(HttpEngine),
}

impl AnyEngine {
    pub fn for_config(config: EngineConfig) -> Self {
        match config.protocol {
            Protocol::Tcp | Protocol::Udp => Self::Socket(SocketEngine::new(config)),
            Protocol::Http => Self::Http(HttpEngine::new(config)),
        }
    }

    pub async fn run(&self, cancel: Arc<AtomicBool>) -> EngineResult<()> {
        match self {
            Self::Socket(engine) => engine.run(cancel).await,
            Self::Http(engine) => engine.run(cancel).await,
        }
    }

    pub fn metrics(&self) -> Metrics {
        match self {
            Self::Socket(engine) => engine.metrics(),
            Self::Http(engine) => engine.metrics(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Self::Socket(engine) => engine.is_running(),
            Self::Http(engine) => engine.is_running(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_bytes_stay_out_of_measurement() {
        let gate = WarmupGate::new(Duration::from_secs(60));
        assert_eq!(gate.on_bytes(1000), ByteWindow::Grace);
        assert_eq!(gate.on_bytes(500), ByteWindow::Grace);
        assert_eq!(gate.grace_bytes(), 1500);
        assert!(!gate.is_measuring());
    }

    #[test]
    fn first_byte_after_warmup_wins_exactly_once() {
        let gate = WarmupGate::new(Duration::ZERO);
        assert_eq!(gate.on_bytes(100), ByteWindow::First);
        assert_eq!(gate.on_bytes(100), ByteWindow::Measured);
        assert_eq!(gate.on_bytes(100), ByteWindow::Measured);
        assert!(gate.is_measuring());
        assert_eq!(gate.grace_bytes(), 0);
    }

    #[test]
    fn zero_warmup_opens_measurement_immediately() {
        let gate = WarmupGate::new(Duration::ZERO);
        assert!(!gate.is_measuring());
        gate.on_bytes(1);
        assert!(gate.is_measuring());
    }

    #[test]
    fn engine_config_maps_stream_config() {
        use crate::stream::{Mode, StreamConfig};
        let cfg = StreamConfig {
            protocol: Protocol::Tcp,
            direction: Direction::Download,
            duration: 5,
            streams: 4,
            packet_size: Some(1200),
            chunk_size: None,
            warm_up: 2,
            mode: Mode::Client,
        };
        let engine_cfg = EngineConfig::from_stream_config(&cfg, "127.0.0.1:8081".into());
        assert_eq!(engine_cfg.stream_count, 4);
        assert_eq!(engine_cfg.packet_size, 1200);
        assert_eq!(engine_cfg.total_window(), Duration::from_secs(7));
    }
}

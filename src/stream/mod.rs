pub mod manager;

pub use manager::StreamManager;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::metrics::Metrics;

// ─── Wire enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
    Bidirectional,
}

/// Who drives the data plane: the client dials the test listener
/// itself, or the server runs the engine and the client watches the
/// WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Proxy,
}

/// Monotonic lifecycle; no transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Streams in these states count against admission limits.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Starting, Completed)
                | (Starting, Failed)
                | (Starting, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

// ─── StreamConfig ────────────────────────────────────────────────

/// The start-request body, persisted verbatim into the results
/// envelope's `config` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub protocol: Protocol,
    pub direction: Direction,
    /// Seconds of measurement, 1–300.
    pub duration: u64,
    /// Parallel sub-streams, 1–64.
    pub streams: u32,
    /// Datagram / record granularity, 64–9000; tcp/udp only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_size: Option<usize>,
    /// Transfer chunk hint, 64 KiB–4 MiB; http only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    /// Seconds of warm-up before the measurement window opens.
    #[serde(default)]
    pub warm_up: u64,
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

fn default_mode() -> Mode {
    Mode::Client
}

pub const MIN_PACKET_SIZE: usize = 64;
pub const MAX_PACKET_SIZE: usize = 9000;
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

impl StreamConfig {
    /// Range- and combination-check the request. Server-level caps
    /// (max_streams, max_test_duration) are enforced by the manager on
    /// top of these protocol-level bounds.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.duration == 0 || self.duration > 300 {
            return Err(ApiError::InvalidConfig(
                "duration must be between 1 and 300 seconds".into(),
            ));
        }
        if self.streams == 0 || self.streams > 64 {
            return Err(ApiError::InvalidConfig(
                "streams must be between 1 and 64".into(),
            ));
        }
        if self.warm_up >= self.duration {
            return Err(ApiError::InvalidConfig(
                "warm_up must be shorter than duration".into(),
            ));
        }

        match self.protocol {
            Protocol::Tcp | Protocol::Udp => {
                let size = self.packet_size.ok_or_else(|| {
                    ApiError::InvalidConfig("packet_size is required for tcp/udp tests".into())
                })?;
                if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
                    return Err(ApiError::InvalidConfig(format!(
                        "packet_size must be between {MIN_PACKET_SIZE} and {MAX_PACKET_SIZE}"
                    )));
                }
            }
            Protocol::Http => {
                if self.direction == Direction::Bidirectional {
                    return Err(ApiError::InvalidConfig(
                        "http tests cannot run bidirectional".into(),
                    ));
                }
                let size = self.chunk_size.ok_or_else(|| {
                    ApiError::InvalidConfig("chunk_size is required for http tests".into())
                })?;
                if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
                    return Err(ApiError::InvalidConfig(format!(
                        "chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}"
                    )));
                }
            }
        }

        Ok(())
    }
}

// ─── TestStream ──────────────────────────────────────────────────

/// One measurement session. Created and transitioned by the manager;
/// the owning engine mutates metrics through `update`; evicted by the
/// retention sweeper after a terminal transition ages out.
#[derive(Debug)]
pub struct TestStream {
    pub id: String,
    pub config: StreamConfig,
    pub client_ip: IpAddr,
    pub created_at: DateTime<Utc>,
    /// Shared with every data-plane worker of this stream; workers
    /// observe a cancel within one I/O deadline.
    cancel_flag: Arc<AtomicBool>,
    progress: Mutex<StreamProgress>,
}

#[derive(Debug)]
struct StreamProgress {
    state: StreamState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    percent: f64,
    metrics: Option<Metrics>,
    error: Option<String>,
}

/// Deep copy of a stream's observable state; this is what crosses the
/// broadcast channel and the read endpoints, so no live references to
/// manager-owned data ever escape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub state: StreamState,
    pub progress: f64,
    pub config: StreamConfig,
    pub client_ip: IpAddr,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 128-bit random stream ID rendered as a URL-safe token. IDs are
/// never reused within a process, even after eviction.
pub fn new_stream_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl TestStream {
    pub fn new(id: String, config: StreamConfig, client_ip: IpAddr) -> Self {
        Self {
            id,
            config,
            client_ip,
            created_at: Utc::now(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            progress: Mutex::new(StreamProgress {
                state: StreamState::Pending,
                start_time: None,
                end_time: None,
                percent: 0.0,
                metrics: None,
                error: None,
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn state(&self) -> StreamState {
        self.progress.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.progress.lock().end_time
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let p = self.progress.lock();
        StreamSnapshot {
            stream_id: self.id.clone(),
            state: p.state,
            progress: p.percent,
            config: self.config.clone(),
            client_ip: self.client_ip,
            created_at: self.created_at,
            start_time: p.start_time,
            end_time: p.end_time,
            metrics: p.metrics.clone(),
            error: p.error.clone(),
        }
    }

    // ── Transitions (manager-only callers) ──────────────────────
    // Each transition holds the stream lock for its whole check +
    // mutate, so a losing writer can never leave partial state behind.

    pub(crate) fn mark_starting(&self) -> Result<(), ApiError> {
        let mut p = self.progress.lock();
        if !p.state.can_transition_to(StreamState::Starting) {
            return Err(ApiError::IllegalTransition);
        }
        p.state = StreamState::Starting;
        p.start_time = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn mark_running(&self) -> Result<(), ApiError> {
        let mut p = self.progress.lock();
        if !p.state.can_transition_to(StreamState::Running) {
            return Err(ApiError::IllegalTransition);
        }
        p.state = StreamState::Running;
        Ok(())
    }

    pub(crate) fn mark_completed(&self, metrics: Metrics) -> Result<(), ApiError> {
        let mut p = self.progress.lock();
        if !p.state.can_transition_to(StreamState::Completed) {
            return Err(ApiError::IllegalTransition);
        }
        p.state = StreamState::Completed;
        p.end_time = Some(Utc::now());
        p.metrics = Some(metrics);
        p.percent = 100.0;
        Ok(())
    }

    pub(crate) fn mark_failed(&self, message: String) -> Result<(), ApiError> {
        let mut p = self.progress.lock();
        if !p.state.can_transition_to(StreamState::Failed) {
            return Err(ApiError::IllegalTransition);
        }
        p.state = StreamState::Failed;
        p.end_time = Some(Utc::now());
        p.error = Some(message);
        Ok(())
    }

    pub(crate) fn mark_cancelled(&self) -> Result<(), ApiError> {
        self.cancel_flag.store(true, Ordering::SeqCst);
        let mut p = self.progress.lock();
        if !p.state.can_transition_to(StreamState::Cancelled) {
            return Err(ApiError::IllegalTransition);
        }
        p.state = StreamState::Cancelled;
        p.end_time = Some(Utc::now());
        Ok(())
    }

    /// Merge a metrics snapshot and recompute progress from elapsed
    /// wall time against the configured duration.
    pub(crate) fn merge_metrics(&self, metrics: Metrics) -> Result<(), ApiError> {
        let mut p = self.progress.lock();
        if p.state.is_terminal() {
            return Err(ApiError::IllegalTransition);
        }
        if let Some(start) = p.start_time {
            let elapsed = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
            let total = (self.config.warm_up + self.config.duration) as f64;
            p.percent = (elapsed / total * 100.0).min(100.0);
        }
        p.metrics = Some(metrics);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_config() -> StreamConfig {
        StreamConfig {
            protocol: Protocol::Tcp,
            direction: Direction::Download,
            duration: 10,
            streams: 2,
            packet_size: Some(1400),
            chunk_size: None,
            warm_up: 1,
            mode: Mode::Client,
        }
    }

    fn http_config() -> StreamConfig {
        StreamConfig {
            protocol: Protocol::Http,
            direction: Direction::Download,
            duration: 10,
            streams: 1,
            packet_size: None,
            chunk_size: Some(1024 * 1024),
            warm_up: 0,
            mode: Mode::Client,
        }
    }

    #[test]
    fn duration_boundaries() {
        let mut cfg = tcp_config();
        cfg.duration = 1;
        cfg.warm_up = 0;
        assert!(cfg.validate().is_ok());
        cfg.duration = 300;
        assert!(cfg.validate().is_ok());
        cfg.duration = 0;
        assert!(cfg.validate().is_err());
        cfg.duration = 301;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stream_count_boundaries() {
        let mut cfg = tcp_config();
        cfg.streams = 1;
        assert!(cfg.validate().is_ok());
        cfg.streams = 64;
        assert!(cfg.validate().is_ok());
        cfg.streams = 0;
        assert!(cfg.validate().is_err());
        cfg.streams = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn packet_size_boundaries() {
        let mut cfg = tcp_config();
        cfg.packet_size = Some(64);
        assert!(cfg.validate().is_ok());
        cfg.packet_size = Some(9000);
        assert!(cfg.validate().is_ok());
        cfg.packet_size = Some(63);
        assert!(cfg.validate().is_err());
        cfg.packet_size = Some(9001);
        assert!(cfg.validate().is_err());
        cfg.packet_size = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn chunk_size_required_and_bounded_for_http() {
        let mut cfg = http_config();
        assert!(cfg.validate().is_ok());
        cfg.chunk_size = Some(MIN_CHUNK_SIZE - 1);
        assert!(cfg.validate().is_err());
        cfg.chunk_size = Some(MAX_CHUNK_SIZE);
        assert!(cfg.validate().is_ok());
        cfg.chunk_size = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn http_bidirectional_is_illegal() {
        let mut cfg = http_config();
        cfg.direction = Direction::Bidirectional;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn warm_up_must_fit_inside_duration() {
        let mut cfg = tcp_config();
        cfg.warm_up = 10;
        assert!(cfg.validate().is_err());
        cfg.warm_up = 9;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let s = TestStream::new(new_stream_id(), tcp_config(), "127.0.0.1".parse().unwrap());
        assert_eq!(s.state(), StreamState::Pending);

        s.mark_starting().unwrap();
        s.mark_running().unwrap();
        s.mark_completed(Metrics::empty(2)).unwrap();
        assert_eq!(s.state(), StreamState::Completed);

        // no back-transitions, no second terminal
        assert!(s.mark_running().is_err());
        assert!(s.mark_failed("late".into()).is_err());
        assert!(s.mark_completed(Metrics::empty(2)).is_err());
    }

    #[test]
    fn terminal_transition_stamps_end_time() {
        let s = TestStream::new(new_stream_id(), tcp_config(), "127.0.0.1".parse().unwrap());
        s.mark_starting().unwrap();
        s.mark_running().unwrap();
        s.mark_cancelled().unwrap();

        let snap = s.snapshot();
        assert!(snap.end_time.is_some());
        assert!(snap.end_time.unwrap() >= snap.start_time.unwrap());
        assert!(s.cancel_flag().load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn stream_ids_are_distinct() {
        let a = new_stream_id();
        let b = new_stream_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}

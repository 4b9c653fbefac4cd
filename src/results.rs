use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;
use crate::stream::{StreamConfig, StreamState};

/// Version tag carried on every persisted or broadcast envelope.
pub const SCHEMA_VERSION: &str = "1.0";

/// Empirical TCP-over-IP-over-Ethernet payload → wire-line correction.
pub const DEFAULT_OVERHEAD_FACTOR: f64 = 1.06;

// ─── Result envelopes ────────────────────────────────────────────

/// The final shape a completed test takes everywhere downstream: the
/// `complete` WebSocket frame, the result store, and the formatters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsEnvelope {
    pub schema_version: String,
    pub stream_id: String,
    pub status: StreamState,
    pub config: StreamConfig,
    pub results: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<Interpretation>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl ResultsEnvelope {
    pub fn new(
        stream_id: String,
        status: StreamState,
        config: StreamConfig,
        results: Metrics,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        let duration_seconds = match (start_time, end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            stream_id,
            status,
            config,
            results,
            interpretation: None,
            start_time,
            end_time,
            duration_seconds,
        }
    }
}

// ─── Interpretation (filled by the external diagnostic) ──────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// CLI exit-code convention: a passing grade exits 0, a degraded
    /// one exits 1.
    pub fn is_passing(self) -> bool {
        matches!(self, Grade::A | Grade::B | Grade::C)
    }
}

/// Human-facing verdict produced by the diagnostic grading function.
/// The grading logic lives outside the core; note that a reported
/// packet loss of zero may mean "unmeasured" (TCP-only runs), so
/// graders should not infer loss-sensitive suitability from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub grade: Grade,
    pub summary: String,
    pub latency_rating: String,
    pub speed_rating: String,
    pub stability_rating: String,
    pub suitable_for: Vec<String>,
    pub concerns: Vec<String>,
}

// ─── Hooks ───────────────────────────────────────────────────────

/// Persistence hand-off. The store (append-and-retain, capped at
/// `max_stored_results`) is an external collaborator; the manager only
/// pushes completed envelopes through this seam.
pub trait ResultSink: Send + Sync {
    fn store(&self, envelope: &ResultsEnvelope) -> Result<(), String>;
}

/// Default sink: keep nothing.
pub struct NullSink;

impl ResultSink for NullSink {
    fn store(&self, _envelope: &ResultsEnvelope) -> Result<(), String> {
        Ok(())
    }
}

/// Apply the payload → wire-line overhead correction. Called once at
/// finalization by whichever side reports; byte counts stay raw.
pub fn apply_overhead(measured_mbps: f64, overhead_factor: f64) -> f64 {
    measured_mbps * overhead_factor
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Mode, Protocol};

    fn config() -> StreamConfig {
        StreamConfig {
            protocol: Protocol::Tcp,
            direction: Direction::Download,
            duration: 5,
            streams: 2,
            packet_size: Some(1400),
            chunk_size: None,
            warm_up: 1,
            mode: Mode::Client,
        }
    }

    #[test]
    fn envelope_computes_duration_from_bounds() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(5250);
        let env = ResultsEnvelope::new(
            "s1".into(),
            StreamState::Completed,
            config(),
            Metrics::empty(2),
            Some(start),
            Some(end),
        );
        assert_eq!(env.schema_version, "1.0");
        assert!((env.duration_seconds - 5.25).abs() < 1e-9);
    }

    #[test]
    fn grade_pass_fail_split() {
        assert!(Grade::A.is_passing());
        assert!(Grade::C.is_passing());
        assert!(!Grade::D.is_passing());
        assert!(!Grade::F.is_passing());
    }

    #[test]
    fn overhead_correction_scales_throughput() {
        let corrected = apply_overhead(100.0, DEFAULT_OVERHEAD_FACTOR);
        assert!((corrected - 106.0).abs() < 1e-9);
    }
}

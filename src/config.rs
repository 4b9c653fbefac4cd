use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── ServerConfig ────────────────────────────────────────────────

/// Typed server configuration. Loading (YAML file, flags, env) is the
/// outer binary's concern; the core consumes this struct and validates
/// the ranges once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control-plane HTTP port.
    pub port: u16,
    pub bind_address: String,

    /// Data-plane listener ports for the framed TCP/UDP protocol.
    pub tcp_test_port: u16,
    pub udp_test_port: u16,

    /// Admission limits.
    pub max_concurrent_tests: u32,
    pub max_concurrent_per_ip: u32,
    /// Upper bound on parallel sub-streams a single test may request.
    pub max_streams: u32,
    /// Upper bound on a test's duration in seconds.
    pub max_test_duration: u64,

    /// Empty string disables bearer auth.
    pub auth_token: String,

    /// Control-plane rate limits, per minute.
    pub rate_limit_per_ip: u32,
    pub global_rate_limit: u32,

    /// CORS / WebSocket origin allow-list. `*` opens CORS but is
    /// never honored for cross-origin WebSocket upgrades.
    pub allowed_origins: Vec<String>,

    pub trust_proxy_headers: bool,
    pub trusted_proxy_cidrs: Vec<String>,

    /// Result store hand-off (the store itself is external).
    pub data_dir: PathBuf,
    pub max_stored_results: usize,

    /// Broadcast cadence and WebSocket keep-alive.
    pub metrics_update_interval_ms: u64,
    pub ws_ping_interval_secs: u64,

    /// How long terminal streams stay readable before eviction.
    pub retention_period_secs: u64,
    /// Sweep cadence for the retention pass.
    pub retention_sweep_interval_secs: u64,

    /// Latency histogram shape. Deployment knobs only; never part of
    /// the public metrics schema.
    pub histogram_bucket_count: usize,
    pub histogram_bucket_width_ms: f64,

    /// Payload → wire-line correction applied to HTTP measurements at
    /// finalization. Raw byte counts stay uncorrected.
    pub overhead_factor: f64,

    /// TLS material paths; acquisition and serving are external.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".into(),
            tcp_test_port: 8081,
            udp_test_port: 8082,
            max_concurrent_tests: 10,
            max_concurrent_per_ip: 3,
            max_streams: 64,
            max_test_duration: 300,
            auth_token: String::new(),
            rate_limit_per_ip: 60,
            global_rate_limit: 600,
            allowed_origins: vec!["*".into()],
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
            data_dir: PathBuf::from("data"),
            max_stored_results: 1000,
            metrics_update_interval_ms: 500,
            ws_ping_interval_secs: 30,
            retention_period_secs: 3600,
            retention_sweep_interval_secs: 60,
            histogram_bucket_count: 2000,
            histogram_bucket_width_ms: 1.0,
            overhead_factor: 1.06,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

impl ServerConfig {
    /// Range-check the knobs once, before anything binds a socket.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_streams == 0 || self.max_streams > 64 {
            return Err("max_streams must be between 1 and 64".into());
        }
        if self.max_test_duration == 0 || self.max_test_duration > 300 {
            return Err("max_test_duration must be between 1 and 300 seconds".into());
        }
        if self.max_concurrent_tests == 0 {
            return Err("max_concurrent_tests must be at least 1".into());
        }
        if self.max_concurrent_per_ip == 0 {
            return Err("max_concurrent_per_ip must be at least 1".into());
        }
        if self.histogram_bucket_count == 0 {
            return Err("histogram_bucket_count must be at least 1".into());
        }
        if self.histogram_bucket_width_ms <= 0.0 {
            return Err("histogram_bucket_width_ms must be positive".into());
        }
        if self.overhead_factor < 1.0 {
            return Err("overhead_factor below 1.0 would under-report".into());
        }
        if self.metrics_update_interval_ms == 0 {
            return Err("metrics_update_interval_ms must be positive".into());
        }
        Ok(())
    }

    pub fn auth_enabled(&self) -> bool {
        !self.auth_token.is_empty()
    }

    pub fn metrics_update_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_update_interval_ms)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_knobs_are_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.max_streams = 65;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.max_test_duration = 301;
        assert!(cfg.validate().is_err());

        let mut cfg = ServerConfig::default();
        cfg.overhead_factor = 0.9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_token_disables_auth() {
        let cfg = ServerConfig::default();
        assert!(!cfg.auth_enabled());

        let cfg = ServerConfig {
            auth_token: "secret".into(),
            ..ServerConfig::default()
        };
        assert!(cfg.auth_enabled());
    }
}

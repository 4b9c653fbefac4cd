use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use reqwest::header::ACCEPT_ENCODING;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::results::Interpretation;

/// Serial pings used for the latency estimate.
pub const PING_COUNT: usize = 5;
/// Length of each throughput burst.
pub const BURST_DURATION: Duration = Duration::from_secs(2);
/// Single-stream chunk used by both bursts.
pub const BURST_CHUNK_BYTES: usize = 1024 * 1024;
/// Fail fast if the server cannot even answer a health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

// ─── Shapes ──────────────────────────────────────────────────────

/// Inputs to the diagnostic grading function. `packet_loss_percent`
/// is zero when unmeasured (always, for this HTTP-only check) — the
/// grader must not treat that as a measured clean link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickCheckParams {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
}

#[derive(Debug, Clone)]
pub struct QuickCheckReport {
    pub params: QuickCheckParams,
    pub interpretation: Interpretation,
}

/// Map an outcome to the CLI exit convention: grade A–C passes,
/// D/F and any failure to reach the server exit 1.
pub fn exit_code(outcome: &EngineResult<QuickCheckReport>) -> i32 {
    match outcome {
        Ok(report) if report.interpretation.grade.is_passing() => 0,
        _ => 1,
    }
}

// ─── QuickCheck ──────────────────────────────────────────────────

/// The 3–5 second connectivity check: health probe, five serial
/// pings, a 2 s download burst, and a 2 s upload burst, graded by an
/// injected diagnostic function.
pub struct QuickCheck {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl QuickCheck {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
            auth_token: None,
        }
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub async fn run<G>(&self, grade: G) -> EngineResult<QuickCheckReport>
    where
        G: Fn(&QuickCheckParams) -> Interpretation,
    {
        self.health_probe().await?;
        let (latency_ms, jitter_ms) = self.ping_probe().await?;
        let download_mbps = self.download_burst().await?;
        let upload_mbps = self.upload_burst().await?;

        let params = QuickCheckParams {
            download_mbps,
            upload_mbps,
            latency_ms,
            jitter_ms,
            packet_loss_percent: 0.0,
        };
        debug!(?params, "quick check measured");

        Ok(QuickCheckReport {
            interpretation: grade(&params),
            params,
        })
    }

    // ── Phases ──────────────────────────────────────────────────

    async fn health_probe(&self) -> EngineResult<()> {
        let response = self
            .request(reqwest::Method::GET, "/api/v1/health")
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Five serial round trips; latency is their mean, jitter the
    /// mean absolute consecutive difference.
    async fn ping_probe(&self) -> EngineResult<(f64, f64)> {
        let mut samples = Vec::with_capacity(PING_COUNT);
        for _ in 0..PING_COUNT {
            let start = Instant::now();
            let response = self.request(reqwest::Method::GET, "/api/v1/ping").send().await?;
            if !response.status().is_success() {
                return Err(EngineError::HttpStatus(response.status().as_u16()));
            }
            response.bytes().await?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }

        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let jitter = samples
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).abs())
            .sum::<f64>()
            / (samples.len() - 1) as f64;
        Ok((avg, jitter))
    }

    async fn download_burst(&self) -> EngineResult<f64> {
        let path = format!(
            "/api/v1/download?duration={}&chunk={}",
            BURST_DURATION.as_secs(),
            BURST_CHUNK_BYTES
        );
        let deadline = Instant::now() + BURST_DURATION;
        let start = Instant::now();
        let mut bytes_total: u64 = 0;

        let response = self
            .request(reqwest::Method::GET, &path)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::HttpStatus(response.status().as_u16()));
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => bytes_total += bytes.len() as u64,
                Err(_) => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        Ok(mbps(bytes_total, start.elapsed()))
    }

    async fn upload_burst(&self) -> EngineResult<f64> {
        let mut payload = vec![0u8; BURST_CHUNK_BYTES];
        rand::thread_rng().fill_bytes(&mut payload);
        let payload = Bytes::from(payload);

        let deadline = Instant::now() + BURST_DURATION;
        let start = Instant::now();
        let mut bytes_total: u64 = 0;

        while Instant::now() < deadline {
            let response = self
                .request(reqwest::Method::POST, "/api/v1/upload")
                .body(payload.clone())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(EngineError::HttpStatus(response.status().as_u16()));
            }
            bytes_total += payload.len() as u64;
        }

        Ok(mbps(bytes_total, start.elapsed()))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 * 8.0 / elapsed.as_secs_f64().max(1e-9) / 1e6
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::Grade;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use std::future::IntoFuture;

    fn stub_interpretation(grade: Grade) -> Interpretation {
        Interpretation {
            grade,
            summary: "stub".into(),
            latency_rating: "good".into(),
            speed_rating: "good".into(),
            stability_rating: "good".into(),
            suitable_for: vec!["browsing".into()],
            concerns: Vec::new(),
        }
    }

    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        format!("http://{addr}")
    }

    fn healthy_stub() -> Router {
        Router::new()
            .route("/api/v1/health", get(|| async { "ok" }))
            .route("/api/v1/ping", get(|| async { "pong" }))
            .route("/api/v1/download", get(|| async { vec![0u8; 512 * 1024] }))
            .route("/api/v1/upload", post(|_body: bytes::Bytes| async { StatusCode::OK }))
    }

    #[tokio::test]
    async fn passing_grade_exits_zero() {
        let base = spawn_stub(healthy_stub()).await;
        let outcome = QuickCheck::new(base)
            .run(|_params| stub_interpretation(Grade::A))
            .await;

        let report = outcome.as_ref().unwrap();
        assert!(report.params.latency_ms > 0.0);
        assert!(report.params.download_mbps > 0.0);
        assert!(report.params.upload_mbps > 0.0);
        assert_eq!(exit_code(&outcome), 0);
    }

    #[tokio::test]
    async fn degraded_grade_exits_one() {
        let base = spawn_stub(healthy_stub()).await;
        let outcome = QuickCheck::new(base)
            .run(|_params| stub_interpretation(Grade::D))
            .await;
        assert_eq!(exit_code(&outcome), 1);
    }

    #[tokio::test]
    async fn unhealthy_server_fails_fast() {
        let app = Router::new()
            .route("/api/v1/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = spawn_stub(app).await;

        let outcome = QuickCheck::new(base)
            .run(|_params| stub_interpretation(Grade::A))
            .await;
        assert!(matches!(outcome, Err(EngineError::HttpStatus(503))));
        assert_eq!(exit_code(&outcome), 1);
    }

    #[tokio::test]
    async fn unreachable_server_fails() {
        // bind then drop to get a dead port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = QuickCheck::new(format!("http://{addr}"))
            .run(|_params| stub_interpretation(Grade::A))
            .await;
        assert_eq!(exit_code(&outcome), 1);
    }
}

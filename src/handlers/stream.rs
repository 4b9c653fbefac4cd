use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Host, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{check_rate_limit, client_ip, require_auth};
use crate::engine::{AnyEngine, EngineConfig};
use crate::error::ApiError;
use crate::metrics::{LatencyStats, Metrics};
use crate::results::apply_overhead;
use crate::stream::{Mode, Protocol, StreamConfig, StreamSnapshot, TestStream};
use crate::AppState;

// ─── Wire shapes ─────────────────────────────────────────────────

/// 201 response to a start request.
#[derive(Debug, Serialize)]
pub struct SessionDescriptor {
    pub stream_id: String,
    pub websocket_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_server_tcp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_server_udp: Option<String>,
    pub status: &'static str,
    pub mode: Mode,
}

/// Final metrics posted by a client-mode session.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub status: String,
    pub metrics: FinalMetrics,
}

#[derive(Debug, Deserialize)]
pub struct FinalMetrics {
    pub throughput_mbps: f64,
    #[serde(default)]
    pub throughput_avg_mbps: f64,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default)]
    pub packet_loss_percent: f64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_received: u64,
    #[serde(default)]
    pub latency_ms: LatencyStats,
}

impl FinalMetrics {
    fn into_metrics(self, stream_count: u32) -> Metrics {
        Metrics {
            throughput_mbps: self.throughput_mbps,
            throughput_avg_mbps: if self.throughput_avg_mbps > 0.0 {
                self.throughput_avg_mbps
            } else {
                self.throughput_mbps
            },
            latency_ms: self.latency_ms,
            rtt: None,
            jitter_ms: self.jitter_ms,
            packet_loss_percent: self.packet_loss_percent,
            bytes_transferred: self.bytes_transferred,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            timestamp: chrono::Utc::now(),
            stream_count,
        }
    }
}

// ─── POST /api/v1/stream/start ───────────────────────────────────

pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    Host(host): Host,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    require_auth(&state, &headers)?;
    let ip = client_ip(&state, &headers, peer);
    check_rate_limit(&state, ip)?;

    let config: StreamConfig = serde_json::from_value(body)
        .map_err(|err| ApiError::MalformedRequest(err.to_string()))?;

    let stream = state.manager.create_stream(config, ip)?;

    match stream.mode() {
        Mode::Client => {
            state.manager.start_stream(&stream.id)?;
        }
        Mode::Proxy => {
            let state = Arc::clone(&state);
            let stream = Arc::clone(&stream);
            tokio::spawn(drive_proxy_session(state, stream));
        }
    }

    let hostname = host.split(':').next().unwrap_or("localhost").to_string();
    let descriptor = SessionDescriptor {
        stream_id: stream.id.clone(),
        websocket_url: format!("ws://{host}/api/v1/stream/{}/ws", stream.id),
        test_server_tcp: matches!(stream.config.protocol, Protocol::Tcp).then(|| {
            format!("{hostname}:{}", state.config.tcp_test_port)
        }),
        test_server_udp: matches!(stream.config.protocol, Protocol::Udp).then(|| {
            format!("{hostname}:{}", state.config.udp_test_port)
        }),
        status: "created",
        mode: stream.mode(),
    };
    Ok((StatusCode::CREATED, Json(descriptor)))
}

// ─── POST /api/v1/stream/{id}/cancel ─────────────────────────────

/// Idempotent: cancelling an already-terminal stream is a 200.
pub async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<StreamSnapshot>, ApiError> {
    require_auth(&state, &headers)?;
    check_rate_limit(&state, client_ip(&state, &headers, peer))?;

    state.manager.cancel_stream(&id)?;
    state.manager.snapshot(&id).map(Json)
}

// ─── POST /api/v1/stream/{id}/complete ───────────────────────────

pub async fn complete_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<StreamSnapshot>, ApiError> {
    require_auth(&state, &headers)?;
    check_rate_limit(&state, client_ip(&state, &headers, peer))?;

    let request: CompleteRequest = serde_json::from_value(body)
        .map_err(|err| ApiError::MalformedRequest(err.to_string()))?;
    if request.status != "completed" {
        return Err(ApiError::MalformedRequest(format!(
            "unexpected status '{}'",
            request.status
        )));
    }

    let stream = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(id.clone()))?;
    let metrics = request.metrics.into_metrics(stream.config.streams);

    state.manager.complete_stream(&id, metrics)?;
    state.manager.snapshot(&id).map(Json)
}

// ─── GET /api/v1/stream/{id} ─────────────────────────────────────

/// Read-only state; terminal streams stay readable for the retention
/// period.
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StreamSnapshot>, ApiError> {
    state.manager.snapshot(&id).map(Json)
}

// ─── Proxy-mode driver ───────────────────────────────────────────

/// Server-driven session: run the engine against the local data plane
/// and push metric snapshots at the configured tick until the engine
/// drains.
pub async fn drive_proxy_session(state: Arc<AppState>, stream: Arc<TestStream>) {
    if state.manager.start_stream(&stream.id).is_err() {
        return;
    }

    let target = match stream.config.protocol {
        Protocol::Tcp => format!("127.0.0.1:{}", state.config.tcp_test_port),
        Protocol::Udp => format!("127.0.0.1:{}", state.config.udp_test_port),
        Protocol::Http => format!("http://127.0.0.1:{}", state.config.port),
    };

    let mut engine_config = EngineConfig::from_stream_config(&stream.config, target);
    engine_config.bucket_count = state.config.histogram_bucket_count;
    engine_config.bucket_width_ms = state.config.histogram_bucket_width_ms;
    if state.config.auth_enabled() {
        engine_config.auth_token = Some(state.config.auth_token.clone());
    }
    let engine = Arc::new(AnyEngine::for_config(engine_config));

    let runner = {
        let engine = Arc::clone(&engine);
        let cancel = stream.cancel_flag();
        tokio::spawn(async move { engine.run(cancel).await })
    };
    tokio::pin!(runner);

    let mut ticker = tokio::time::interval(state.config.metrics_update_interval());
    ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            joined = &mut runner => {
                match joined {
                    Ok(Ok(())) => {
                        if !stream.is_terminal() {
                            let metrics = finalize_metrics(&state, &stream, engine.metrics());
                            let _ = state.manager.complete_stream(&stream.id, metrics);
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(stream_id = %stream.id, error = %err, "proxy session failed");
                        let _ = state.manager.fail_stream(&stream.id, err.to_string());
                    }
                    Err(join_err) => {
                        let _ = state
                            .manager
                            .fail_stream(&stream.id, format!("engine task died: {join_err}"));
                    }
                }
                return;
            }
            _ = ticker.tick() => {
                let _ = state.manager.update_metrics(&stream.id, engine.metrics());
            }
        }
    }
}

/// The one place the overhead correction is applied: HTTP sessions at
/// finalization. Byte counts stay raw.
fn finalize_metrics(state: &AppState, stream: &TestStream, mut metrics: Metrics) -> Metrics {
    if stream.config.protocol == Protocol::Http {
        metrics.throughput_mbps = apply_overhead(metrics.throughput_mbps, state.config.overhead_factor);
        metrics.throughput_avg_mbps =
            apply_overhead(metrics.throughput_avg_mbps, state.config.overhead_factor);
    }
    metrics
}

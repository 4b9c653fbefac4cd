use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use super::require_auth;
use crate::error::ApiError;
use crate::AppState;

/// Fallback streaming window when the client sends no duration.
const DEFAULT_DOWNLOAD_SECS: u64 = 10;
const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

// ─── GET /api/v1/ping ────────────────────────────────────────────

/// Trivial body; clients time this round trip for HTTP latency.
pub async fn ping() -> &'static str {
    "pong"
}

// ─── GET /api/v1/health ──────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ─── GET /api/v1/download ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub chunk: Option<usize>,
}

/// Stream payload bytes for at most `duration` seconds, capped by the
/// server's maximum test duration. `chunk` is a granularity hint.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DownloadParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_auth(&state, &headers)?;

    let secs = params
        .duration
        .unwrap_or(DEFAULT_DOWNLOAD_SECS)
        .min(state.config.max_test_duration)
        .max(1);
    let chunk_len = params
        .chunk
        .unwrap_or(DEFAULT_CHUNK_BYTES)
        .clamp(1024, 4 * 1024 * 1024);

    let mut payload = vec![0u8; chunk_len];
    rand::thread_rng().fill_bytes(&mut payload);
    let chunk = Bytes::from(payload);
    let deadline = Instant::now() + Duration::from_secs(secs);

    let body = futures::stream::unfold(chunk, move |chunk| async move {
        if Instant::now() >= deadline {
            return None;
        }
        Some((Ok::<Bytes, Infallible>(chunk.clone()), chunk))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(body),
    ))
}

// ─── POST /api/v1/upload ─────────────────────────────────────────

/// Drain and discard the request body, reporting how many bytes
/// arrived.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    ConnectInfo(_peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    require_auth(&state, &headers)?;

    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => received += bytes.len() as u64,
            Err(_) => break,
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!({ "status": "ok", "bytes_received": received })),
    ))
}

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::info;

/// Tower-compatible middleware that adds two response headers:
///
///   X-Response-Time-Us  — total handler wall time in microseconds
///   Server-Timing       — same value in the standard Server-Timing format
///
/// Also emits one structured request event per API call.
pub async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    // ── Inject response headers ─────────────────────────────────
    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    // ── Request log ─────────────────────────────────────────────
    // Skip the chatty data-plane paths; they run many calls per second.
    let status = response.status().as_u16();
    if path.starts_with("/api/")
        && !path.ends_with("/ws")
        && !path.ends_with("/download")
        && !path.ends_with("/upload")
    {
        info!(%method, %path, status, duration_us = us as u64, "request");
    }

    response
}

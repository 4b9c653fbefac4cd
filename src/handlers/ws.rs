use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Host, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::broadcast::WsFrame;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::results::ResultsEnvelope;
use crate::AppState;

// ─── GET /api/v1/stream/{id}/ws ──────────────────────────────────

/// Upgrade a subscriber onto a stream's live frames. Cross-origin
/// upgrades must match the allow-list exactly; a wildcard entry is
/// never honored here.
pub async fn stream_ws(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Host(host): Host,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_allowed(&state.config.allowed_origins, origin, &host) {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let Some(stream) = state.manager.get(&id) else {
        return ApiError::NotFound(id).into_response();
    };

    // A terminal stream still answers: replay the final envelope.
    if stream.is_terminal() {
        let snap = stream.snapshot();
        let envelope = ResultsEnvelope::new(
            snap.stream_id,
            snap.state,
            snap.config.clone(),
            snap.metrics
                .unwrap_or_else(|| Metrics::empty(snap.config.streams)),
            snap.start_time,
            snap.end_time,
        );
        return ws.on_upgrade(move |socket| replay_terminal(socket, envelope));
    }

    let Some(rx) = state.manager.hub().subscribe(&id) else {
        return ApiError::NotFound(id).into_response();
    };

    let ping_interval = state.config.ws_ping_interval();
    ws.on_upgrade(move |socket| run_subscriber(socket, rx, ping_interval))
}

fn origin_allowed(allowed: &[String], origin: &str, host: &str) -> bool {
    // same-origin upgrades are always fine
    if origin
        .split_once("://")
        .map(|(_, rest)| rest == host)
        .unwrap_or(false)
    {
        return true;
    }
    allowed.iter().any(|entry| entry != "*" && entry == origin)
}

// ─── Subscriber loop ─────────────────────────────────────────────

/// One writer task per subscriber. The broadcast channel bounds the
/// outgoing queue; a receiver that lags is closed with a policy
/// violation instead of back-pressuring the broadcaster.
async fn run_subscriber(
    socket: WebSocket,
    mut rx: broadcast::Receiver<WsFrame>,
    ping_interval: Duration,
) {
    let (mut sink, mut source) = socket.split();
    let idle_timeout = ping_interval * 2;
    let mut last_seen = Instant::now();
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    let done = frame.is_complete();
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                    if done {
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "stream finished".into(),
                        }))).await;
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "dropping slow websocket subscriber");
                    let _ = sink.send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "subscriber too slow".into(),
                    }))).await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    return;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(_)) => return,
            },
        }
    }
}

/// Late subscriber to a finished stream: one `complete` frame, then a
/// normal close.
async fn replay_terminal(mut socket: WebSocket, envelope: ResultsEnvelope) {
    let frame = WsFrame::Complete {
        results: Box::new(envelope),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "stream finished".into(),
        })))
        .await;
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_is_always_allowed() {
        assert!(origin_allowed(&[], "http://example.com:8080", "example.com:8080"));
    }

    #[test]
    fn cross_origin_requires_exact_entry() {
        let allowed = vec!["https://dash.example.com".to_string()];
        assert!(origin_allowed(&allowed, "https://dash.example.com", "api.example.com"));
        assert!(!origin_allowed(&allowed, "https://evil.example.com", "api.example.com"));
    }

    #[test]
    fn wildcard_never_allows_cross_origin_upgrades() {
        let allowed = vec!["*".to_string()];
        assert!(!origin_allowed(&allowed, "https://anywhere.example", "api.example.com"));
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use reqwest::header::ACCEPT_ENCODING;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ByteWindow, EngineConfig, WarmupGate, DEFAULT_STREAM_DELAY};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{Metrics, MultiStreamAggregator, StreamCollector, TransferDirection};

/// Upload requests reuse one fixed random payload of at least this
/// size; the server must not assume payload uniqueness.
pub const MIN_UPLOAD_PAYLOAD: usize = 4 * 1024 * 1024;

// ─── HttpEngine ──────────────────────────────────────────────────

/// Bulk-HTTP data-plane engine: GET-drain for download, repeated
/// fixed-payload POSTs for upload. Sub-stream starts are staggered to
/// decorrelate TCP slow-start across connections.
///
/// The engine reports raw byte counts; the payload → wire-line
/// overhead correction is the reporter's job at finalization.
pub struct HttpEngine {
    config: EngineConfig,
    aggregator: Arc<MultiStreamAggregator>,
    client: reqwest::Client,
    running: AtomicBool,
}

impl HttpEngine {
    pub fn new(config: EngineConfig) -> Self {
        let aggregator = Arc::new(MultiStreamAggregator::with_histogram_config(
            config.stream_count,
            config.bucket_width_ms,
            config.bucket_count,
        ));
        let client = reqwest::Client::builder()
            .connect_timeout(super::DIAL_TIMEOUT)
            .build()
            .expect("http client construction cannot fail with static options");
        Self {
            config,
            aggregator,
            client,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Metrics {
        self.aggregator.aggregated_metrics()
    }

    pub async fn run(&self, cancel: Arc<AtomicBool>) -> EngineResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner(cancel).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, cancel: Arc<AtomicBool>) -> EngineResult<()> {
        let gate = Arc::new(WarmupGate::new(self.config.warm_up));
        let deadline = Instant::now() + self.config.total_window();
        let (err_tx, mut err_rx) = mpsc::channel(self.config.stream_count);

        let upload_payload = match self.config.direction {
            crate::stream::Direction::Upload => {
                let len = self.config.chunk_size.max(MIN_UPLOAD_PAYLOAD);
                let mut payload = vec![0u8; len];
                rand::thread_rng().fill_bytes(&mut payload);
                Some(Bytes::from(payload))
            }
            _ => None,
        };

        let mut handles = Vec::with_capacity(self.config.stream_count);
        for i in 0..self.config.stream_count {
            let ctx = HttpCtx {
                collector: self.aggregator.collector(i),
                aggregator: Arc::clone(&self.aggregator),
                gate: Arc::clone(&gate),
                cancel: Arc::clone(&cancel),
                deadline,
                err_tx: err_tx.clone(),
                client: self.client.clone(),
                auth_token: self.config.auth_token.clone(),
            };
            let stagger = DEFAULT_STREAM_DELAY * i as u32;
            let direction = self.config.direction;
            let download_url = format!(
                "{}/api/v1/download?duration={}&chunk={}",
                self.config.target.trim_end_matches('/'),
                self.config.total_window().as_secs().max(1),
                self.config.chunk_size,
            );
            let upload_url = format!(
                "{}/api/v1/upload",
                self.config.target.trim_end_matches('/')
            );
            let payload = upload_payload.clone();

            handles.push(tokio::spawn(async move {
                tokio::time::sleep(stagger).await;
                match direction {
                    crate::stream::Direction::Download => download_worker(ctx, download_url).await,
                    crate::stream::Direction::Upload => {
                        let payload = payload.expect("upload direction carries a payload");
                        upload_worker(ctx, upload_url, payload).await;
                    }
                    crate::stream::Direction::Bidirectional => {
                        unreachable!("http + bidirectional is rejected at admission")
                    }
                }
            }));
        }
        drop(err_tx);

        for handle in handles {
            let _ = handle.await;
        }
        debug!(bytes = self.aggregator.total_bytes(), "bulk-http session drained");

        while let Ok(err) = err_rx.try_recv() {
            if !err.is_cancellation() {
                return Err(err);
            }
        }
        Ok(())
    }
}

// ─── Worker context ──────────────────────────────────────────────

struct HttpCtx {
    collector: Arc<StreamCollector>,
    aggregator: Arc<MultiStreamAggregator>,
    gate: Arc<WarmupGate>,
    cancel: Arc<AtomicBool>,
    deadline: Instant,
    err_tx: mpsc::Sender<EngineError>,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpCtx {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    fn account(&self, n: u64, dir: TransferDirection) {
        match self.gate.on_bytes(n) {
            ByteWindow::Grace => {}
            ByteWindow::First => {
                self.aggregator.reset();
                self.collector.record_bytes(n, dir);
            }
            ByteWindow::Measured => self.collector.record_bytes(n, dir),
        }
    }

    fn report(&self, err: EngineError) {
        let _ = self.err_tx.try_send(err);
    }
}

// ─── Workers ─────────────────────────────────────────────────────

async fn download_worker(ctx: HttpCtx, url: String) {
    loop {
        if ctx.should_stop() {
            return;
        }

        let mut request = ctx.client.get(&url).header(ACCEPT_ENCODING, "identity");
        if let Some(token) = &ctx.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                ctx.report(err.into());
                return;
            }
        };
        if !response.status().is_success() {
            ctx.report(EngineError::HttpStatus(response.status().as_u16()));
            return;
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => ctx.account(bytes.len() as u64, TransferDirection::Received),
                // mid-body hiccup: reconnect rather than fail the run
                Err(_) => break,
            }
            if ctx.should_stop() {
                return;
            }
        }
    }
}

async fn upload_worker(ctx: HttpCtx, url: String, payload: Bytes) {
    loop {
        if ctx.should_stop() {
            return;
        }

        let mut request = ctx.client.post(&url).body(payload.clone());
        if let Some(token) = &ctx.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                ctx.account(payload.len() as u64, TransferDirection::Sent);
            }
            Ok(response) => {
                ctx.report(EngineError::HttpStatus(response.status().as_u16()));
                return;
            }
            Err(err) => {
                ctx.report(err.into());
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Direction, Protocol};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;
    use std::future::IntoFuture;
    use std::time::Duration;

    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        format!("http://{addr}")
    }

    fn engine_config(target: String, direction: Direction, duration: Duration) -> EngineConfig {
        EngineConfig {
            protocol: Protocol::Http,
            direction,
            duration,
            warm_up: Duration::ZERO,
            stream_count: 1,
            packet_size: 1400,
            chunk_size: 1024 * 1024,
            target,
            auth_token: None,
            bucket_count: 2000,
            bucket_width_ms: 1.0,
        }
    }

    #[tokio::test]
    async fn download_drains_response_bodies() {
        let app = Router::new().route(
            "/api/v1/download",
            get(|| async { vec![0u8; 256 * 1024] }),
        );
        let base = spawn_stub(app).await;

        let engine = HttpEngine::new(engine_config(
            base,
            Direction::Download,
            Duration::from_millis(400),
        ));
        engine.run(Arc::new(AtomicBool::new(false))).await.unwrap();

        let metrics = engine.metrics();
        assert!(metrics.bytes_transferred >= 256 * 1024);
    }

    #[tokio::test]
    async fn upload_posts_at_least_one_full_payload() {
        let app = Router::new().route(
            "/api/v1/upload",
            post(|body: bytes::Bytes| async move {
                assert!(!body.is_empty());
                StatusCode::OK
            }),
        );
        let base = spawn_stub(app).await;

        let engine = HttpEngine::new(engine_config(
            base,
            Direction::Upload,
            Duration::from_secs(1),
        ));
        engine.run(Arc::new(AtomicBool::new(false))).await.unwrap();

        // payload floor is 4 MiB even with a 1 MiB chunk hint
        assert!(engine.metrics().bytes_transferred >= MIN_UPLOAD_PAYLOAD as u64);
    }

    #[tokio::test]
    async fn non_2xx_fails_the_sub_stream() {
        let app = Router::new().route(
            "/api/v1/download",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let base = spawn_stub(app).await;

        let engine = HttpEngine::new(engine_config(
            base,
            Direction::Download,
            Duration::from_secs(2),
        ));
        let err = engine.run(Arc::new(AtomicBool::new(false))).await.unwrap_err();
        assert!(matches!(err, EngineError::HttpStatus(503)));
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{new_stream_id, StreamConfig, StreamSnapshot, StreamState, TestStream};
use crate::broadcast::{BroadcastHub, WsFrame};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::results::{NullSink, ResultSink, ResultsEnvelope};

// ─── StreamManager ───────────────────────────────────────────────

/// Admission, lifecycle, and retention for every measurement session
/// in the process.
///
/// One coarse lock guards the stream map and the per-IP counts; each
/// stream's own scalars sit behind the stream's lock, so metric
/// updates on unrelated streams never serialize against each other.
pub struct StreamManager {
    limits: Limits,
    hub: Arc<BroadcastHub>,
    sink: Arc<dyn ResultSink>,
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone)]
struct Limits {
    max_concurrent_tests: u32,
    max_concurrent_per_ip: u32,
    max_streams: u32,
    max_test_duration: u64,
    retention_period: Duration,
    sweep_interval: Duration,
    metrics_update_interval: Duration,
}

struct Inner {
    streams: HashMap<String, Arc<TestStream>>,
    per_ip: HashMap<IpAddr, u32>,
}

impl StreamManager {
    pub fn new(config: &ServerConfig, hub: Arc<BroadcastHub>) -> Self {
        Self {
            limits: Limits {
                max_concurrent_tests: config.max_concurrent_tests,
                max_concurrent_per_ip: config.max_concurrent_per_ip,
                max_streams: config.max_streams,
                max_test_duration: config.max_test_duration,
                retention_period: config.retention_period(),
                sweep_interval: config.retention_sweep_interval(),
                metrics_update_interval: config.metrics_update_interval(),
            },
            hub,
            sink: Arc::new(NullSink),
            inner: RwLock::new(Inner {
                streams: HashMap::new(),
                per_ip: HashMap::new(),
            }),
        }
    }

    /// Swap in the external result store; completed envelopes are
    /// pushed through it on every terminal transition.
    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    // ── Admission ───────────────────────────────────────────────

    /// Validate and admit a new stream. Rejections never mutate any
    /// manager state.
    pub fn create_stream(
        &self,
        config: StreamConfig,
        client_ip: IpAddr,
    ) -> Result<Arc<TestStream>, ApiError> {
        config.validate()?;
        if config.streams > self.limits.max_streams {
            return Err(ApiError::InvalidConfig(format!(
                "this server allows at most {} parallel streams",
                self.limits.max_streams
            )));
        }
        if config.warm_up + config.duration > self.limits.max_test_duration {
            return Err(ApiError::InvalidConfig(format!(
                "this server caps tests at {} seconds",
                self.limits.max_test_duration
            )));
        }

        let mut inner = self.inner.write();

        let active = inner
            .streams
            .values()
            .filter(|s| !s.is_terminal())
            .count() as u32;
        if active >= self.limits.max_concurrent_tests {
            return Err(ApiError::CapacityExceeded);
        }

        let ip_active = inner.per_ip.get(&client_ip).copied().unwrap_or(0);
        if ip_active >= self.limits.max_concurrent_per_ip {
            return Err(ApiError::PerIpExceeded);
        }

        let stream = Arc::new(TestStream::new(new_stream_id(), config, client_ip));
        inner.streams.insert(stream.id.clone(), Arc::clone(&stream));
        *inner.per_ip.entry(client_ip).or_insert(0) += 1;
        drop(inner);

        self.hub.register(&stream.id);
        info!(stream_id = %stream.id, client_ip = %client_ip, "stream admitted");
        Ok(stream)
    }

    // ── Lookup ──────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Arc<TestStream>> {
        self.inner.read().streams.get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Result<StreamSnapshot, ApiError> {
        self.get(id)
            .map(|s| s.snapshot())
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    /// Streams currently in {starting, running}.
    pub fn active_count(&self) -> u32 {
        self.inner
            .read()
            .streams
            .values()
            .filter(|s| s.state().is_active())
            .count() as u32
    }

    pub fn per_ip_count(&self, ip: IpAddr) -> u32 {
        self.inner.read().per_ip.get(&ip).copied().unwrap_or(0)
    }

    // ── Transitions ─────────────────────────────────────────────

    /// `pending → starting → running`, stamping the start time.
    pub fn start_stream(&self, id: &str) -> Result<(), ApiError> {
        let stream = self.get(id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        stream.mark_starting()?;
        stream.mark_running()?;
        debug!(stream_id = %id, "stream running");
        Ok(())
    }

    /// Merge a metrics snapshot and push `metrics` + `progress` frames
    /// to subscribers. Never blocks: the hub drops oldest on overflow.
    pub fn update_metrics(&self, id: &str, metrics: Metrics) -> Result<(), ApiError> {
        let stream = self.get(id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        stream.merge_metrics(metrics.clone())?;

        let snap = stream.snapshot();
        self.publish_progress(&snap);
        self.hub.publish(
            id,
            WsFrame::Metrics {
                metrics,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn complete_stream(&self, id: &str, final_metrics: Metrics) -> Result<(), ApiError> {
        let stream = self.get(id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        stream.mark_completed(final_metrics)?;
        self.finish(&stream);
        info!(stream_id = %id, "stream completed");
        Ok(())
    }

    pub fn fail_stream(&self, id: &str, message: String) -> Result<(), ApiError> {
        let stream = self.get(id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        self.hub.publish(
            id,
            WsFrame::Error {
                message: message.clone(),
            },
        );
        stream.mark_failed(message)?;
        self.finish(&stream);
        warn!(stream_id = %id, "stream failed");
        Ok(())
    }

    /// Idempotent: cancelling a stream that already reached a terminal
    /// state succeeds without touching it.
    pub fn cancel_stream(&self, id: &str) -> Result<(), ApiError> {
        let stream = self.get(id).ok_or_else(|| ApiError::NotFound(id.to_string()))?;
        if stream.is_terminal() {
            return Ok(());
        }
        stream.mark_cancelled()?;
        self.finish(&stream);
        info!(stream_id = %id, "stream cancelled");
        Ok(())
    }

    /// Terminal bookkeeping shared by complete/fail/cancel: release
    /// the per-IP slot and emit the final `complete` frame.
    fn finish(&self, stream: &Arc<TestStream>) {
        {
            let mut inner = self.inner.write();
            if let Some(count) = inner.per_ip.get_mut(&stream.client_ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_ip.remove(&stream.client_ip);
                }
            }
        }

        let snap = stream.snapshot();
        let envelope = ResultsEnvelope::new(
            snap.stream_id.clone(),
            snap.state,
            snap.config.clone(),
            snap.metrics
                .clone()
                .unwrap_or_else(|| Metrics::empty(snap.config.streams)),
            snap.start_time,
            snap.end_time,
        );
        if let Err(err) = self.sink.store(&envelope) {
            warn!(stream_id = %stream.id, error = %err, "result store rejected envelope");
        }
        self.hub.publish(
            &stream.id,
            WsFrame::Complete {
                results: Box::new(envelope),
            },
        );
    }

    fn publish_progress(&self, snap: &StreamSnapshot) {
        let total = (snap.config.warm_up + snap.config.duration) as f64;
        let elapsed = snap
            .start_time
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        self.hub.publish(
            &snap.stream_id,
            WsFrame::Progress {
                progress: snap.progress,
                elapsed_seconds: elapsed,
                remaining_seconds: (total - elapsed).max(0.0),
                timestamp: Utc::now(),
            },
        );
    }

    // ── Background loops ────────────────────────────────────────

    /// Periodic progress tick for running streams; keeps subscribers
    /// moving between engine metric pushes.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = tokio::time::interval(manager.limits.metrics_update_interval);
        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(interval);
            while ticks.next().await.is_some() {
                let running: Vec<Arc<TestStream>> = {
                    let inner = manager.inner.read();
                    inner
                        .streams
                        .values()
                        .filter(|s| s.state() == StreamState::Running)
                        .cloned()
                        .collect()
                };
                for stream in running {
                    manager.publish_progress(&stream.snapshot());
                }
            }
        })
    }

    /// Retention sweeper: evict terminal streams whose end time aged
    /// past the retention period.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.limits.sweep_interval);
            loop {
                interval.tick().await;
                manager.sweep_expired();
            }
        })
    }

    /// One retention pass; public so tests can drive it directly.
    pub fn sweep_expired(&self) {
        let retention = chrono::Duration::from_std(self.limits.retention_period)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = Utc::now();

        let expired: Vec<String> = {
            let inner = self.inner.read();
            inner
                .streams
                .values()
                .filter(|s| {
                    s.is_terminal()
                        && s.end_time().map(|end| end + retention < now).unwrap_or(false)
                })
                .map(|s| s.id.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        for id in &expired {
            inner.streams.remove(id);
            self.hub.remove(id);
            debug!(stream_id = %id, "stream evicted");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

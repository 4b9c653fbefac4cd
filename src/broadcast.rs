use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metrics::Metrics;
use crate::results::ResultsEnvelope;

/// Outgoing frames buffered per subscriber before a slow consumer is
/// considered lagged and dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

// ─── Frames ──────────────────────────────────────────────────────

/// Frames fanned out to a stream's WebSocket subscribers. `complete`
/// is always the last frame for its stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsFrame {
    Progress {
        progress: f64,
        elapsed_seconds: f64,
        remaining_seconds: f64,
        timestamp: DateTime<Utc>,
    },
    Metrics {
        metrics: Metrics,
        timestamp: DateTime<Utc>,
    },
    Complete {
        results: Box<ResultsEnvelope>,
    },
    Error {
        message: String,
    },
}

impl WsFrame {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

// ─── BroadcastHub ────────────────────────────────────────────────

/// Per-stream fan-out. Each stream gets one bounded broadcast channel;
/// publishing never blocks the producer — the channel overwrites its
/// oldest entries and lagged receivers learn they were dropped.
pub struct BroadcastHub {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<WsFrame>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for a new stream. Idempotent.
    pub fn register(&self, stream_id: &str) {
        let mut channels = self.channels.write();
        channels
            .entry(stream_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Subscribe to a stream's frames. Returns None for unknown ids.
    pub fn subscribe(&self, stream_id: &str) -> Option<broadcast::Receiver<WsFrame>> {
        self.channels.read().get(stream_id).map(|tx| tx.subscribe())
    }

    /// Publish one frame. A send with no live subscribers is fine —
    /// progress frames for unwatched streams just evaporate.
    pub fn publish(&self, stream_id: &str, frame: WsFrame) {
        if let Some(tx) = self.channels.read().get(stream_id) {
            let _ = tx.send(frame);
        }
    }

    /// Drop a stream's channel after eviction; existing receivers see
    /// channel-closed and finish.
    pub fn remove(&self, stream_id: &str) {
        self.channels.write().remove(stream_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────

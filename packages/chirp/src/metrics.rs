//! Server metrics for observability
//!
//! Counters for connections, relayed messages and stash replays.

use chirp_conduit::Delivery;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently registered WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Payloads received from connected endpoints
    pub messages_received: AtomicU64,
    /// Fan-outs performed
    pub broadcasts: AtomicU64,
    /// Individual payload deliveries across all fan-outs
    pub deliveries: AtomicU64,
    /// Deliveries that failed and evicted their endpoint
    pub delivery_failures: AtomicU64,

    // Replay metrics
    /// Connections that were scheduled a stash replay
    pub replays: AtomicU64,
    /// Payloads scheduled across all replays
    pub replayed_payloads: AtomicU64,

    // Error metrics
    /// Failed writes to the message store
    pub feed_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self, delivery: &Delivery) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(delivery.failed as u64, Ordering::Relaxed);
    }

    pub fn replay_scheduled(&self, payloads: usize) {
        self.replays.fetch_add(1, Ordering::Relaxed);
        self.replayed_payloads
            .fetch_add(payloads as u64, Ordering::Relaxed);
    }

    // Error tracking
    pub fn feed_error(&self) {
        self.feed_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            },
            replay: ReplayMetrics {
                replays: self.replays.load(Ordering::Relaxed),
                payloads: self.replayed_payloads.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                feed: self.feed_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub replay: ReplayMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMetrics {
    pub replays: u64,
    pub payloads: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub feed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub stashed: u64,
    pub uptime_secs: u64,
}

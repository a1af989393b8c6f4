//! History kept for late joiners.
//!
//! Unlike a reconnection ring buffer this stash never evicts: every stashed
//! payload is replayed to every endpoint that joins afterwards.

use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::payload::Payload;
use crate::pool::Endpoint;

/// Default spacing between replayed payloads.
pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_millis(100);

/// A replay scheduled by [`ReplayStash::drain_to`].
#[derive(Debug)]
pub struct Replay {
    /// Payloads queued for delivery.
    pub scheduled: usize,
    /// Resolves to the number actually delivered.
    pub task: JoinHandle<usize>,
}

/// Append-only, ordered, unbounded payload history.
#[derive(Default)]
pub struct ReplayStash {
    entries: RwLock<Vec<Payload>>,
}

impl ReplayStash {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, payload: Payload) {
        self.entries.write().await.push(payload);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Payload> {
        self.entries.read().await.clone()
    }

    /// Schedule the current history for delivery to `endpoint`.
    ///
    /// Item `i` goes out `(i + 1) * interval` after this call, one at a time on
    /// a background task, so order is preserved and a joiner is never flooded
    /// synchronously. The task checks liveness before every send and stops at
    /// the first dead endpoint. Returns `None` when there is nothing to replay.
    pub async fn drain_to(&self, endpoint: Endpoint, interval: Duration) -> Option<Replay> {
        let pending = self.snapshot().await;
        if pending.is_empty() {
            return None;
        }

        let total = pending.len();
        let task = tokio::spawn(async move {
            let mut delivered = 0;
            for payload in pending {
                tokio::time::sleep(interval).await;
                if !endpoint.is_alive() {
                    debug!(sid = %endpoint.session_id(), delivered, total, "replay target gone");
                    break;
                }
                if endpoint.send(payload).is_err() {
                    break;
                }
                delivered += 1;
            }
            debug!(sid = %endpoint.session_id(), delivered, total, "replay finished");
            delivered
        });

        Some(Replay {
            scheduled: total,
            task,
        })
    }
}

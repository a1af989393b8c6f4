//! Live endpoint registry.
//!
//! The pool exclusively owns every registered [`Endpoint`]. Handles given out
//! to connection tasks are clones that share the endpoint's liveness token;
//! once the pool retires an endpoint every clone observes it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConduitError, Result};
use crate::payload::Payload;
use crate::session::{RandomSessionIds, SessionId, SessionIdGenerator};

/// Sending half of an endpoint's transport. The connection task drains the
/// receiving half into the socket.
pub type Outbox = mpsc::UnboundedSender<Payload>;
pub type OutboxReceiver = mpsc::UnboundedReceiver<Payload>;

/// Create a fresh outbox pair for a new connection.
pub fn outbox() -> (Outbox, OutboxReceiver) {
    mpsc::unbounded_channel()
}

/// Attempts at drawing a session id that no live endpoint holds.
const MAX_SESSION_ID_ATTEMPTS: usize = 32;

/// How an endpoint left the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retirement {
    /// Taken out by its own close event.
    Removed,
    /// Dropped after a failed send.
    Evicted,
    /// Swept out when the conduit ended.
    Cleared,
}

/// One connected transport plus its session identity.
#[derive(Clone, Debug)]
pub struct Endpoint {
    sid: SessionId,
    seq: u64,
    outbox: Outbox,
    retired: CancellationToken,
    retirement: Arc<OnceLock<Retirement>>,
}

impl Endpoint {
    pub fn session_id(&self) -> &SessionId {
        &self.sid
    }

    /// Join order within the pool.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// True while the pool still holds this endpoint and its transport is open.
    pub fn is_alive(&self) -> bool {
        !self.retired.is_cancelled() && !self.outbox.is_closed()
    }

    /// True once the pool has let go of this endpoint.
    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Why the pool let go of this endpoint, if it has.
    pub fn retirement(&self) -> Option<Retirement> {
        self.retirement.get().copied()
    }

    /// Resolves when the pool retires this endpoint.
    pub async fn retired(&self) {
        self.retired.cancelled().await
    }

    /// Queue a payload on the endpoint's transport.
    pub fn send(&self, payload: Payload) -> Result<()> {
        if self.retired.is_cancelled() {
            return Err(ConduitError::TransportSendFailure {
                session_id: self.sid.clone(),
            });
        }
        self.outbox
            .send(payload)
            .map_err(|_| ConduitError::TransportSendFailure {
                session_id: self.sid.clone(),
            })
    }

    // Called with the pool's write lock held, so the first reason sticks
    fn retire(&self, reason: Retirement) {
        let _ = self.retirement.set(reason);
        self.retired.cancel();
    }
}

/// The set of live endpoints, keyed by session id.
pub struct ConnectionPool {
    endpoints: RwLock<HashMap<SessionId, Endpoint>>,
    ids: Arc<dyn SessionIdGenerator>,
    next_seq: AtomicU64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(RandomSessionIds))
    }

    pub fn with_generator(ids: Arc<dyn SessionIdGenerator>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            ids,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Register a new endpoint and send it the `{"sid": ...}` handshake.
    ///
    /// The handshake is queued before this returns, so it always precedes any
    /// replayed history.
    pub async fn add(&self, outbox: Outbox) -> Result<Endpoint> {
        let mut endpoints = self.endpoints.write().await;

        let mut sid = None;
        for _ in 0..MAX_SESSION_ID_ATTEMPTS {
            let candidate = self.ids.generate();
            if !endpoints.contains_key(&candidate) {
                sid = Some(candidate);
                break;
            }
            warn!(sid = %candidate, "session id collision, drawing another");
        }
        let sid = sid.ok_or(ConduitError::SessionIdExhausted {
            attempts: MAX_SESSION_ID_ATTEMPTS,
        })?;

        let endpoint = Endpoint {
            sid: sid.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            outbox,
            retired: CancellationToken::new(),
            retirement: Arc::new(OnceLock::new()),
        };
        endpoints.insert(sid.clone(), endpoint.clone());

        let handshake = serde_json::json!({ "sid": sid }).to_string();
        if let Err(e) = endpoint.send(Payload::Text(handshake)) {
            // Left in the pool: the close event or the next fan-out cleans it up.
            debug!(sid = %sid, "handshake not delivered: {}", e);
        }

        Ok(endpoint)
    }

    /// Remove the endpoint with `sid`, requiring the pool to shrink by exactly one.
    pub async fn remove(&self, sid: &SessionId) -> Result<Endpoint> {
        let mut endpoints = self.endpoints.write().await;
        Self::remove_locked(&mut endpoints, sid)
    }

    /// Close-event removal.
    ///
    /// Endpoints the pool dropped on its own (evicted after a failed send, or
    /// cleared on shutdown) are skipped. Anything else goes through the strict
    /// [`remove`](Self::remove) check, so closing an endpoint twice is a
    /// [`ConduitError::PoolInvariantViolation`].
    pub async fn release(&self, endpoint: &Endpoint) -> Result<Option<Endpoint>> {
        let mut endpoints = self.endpoints.write().await;
        match endpoint.retirement() {
            Some(Retirement::Evicted | Retirement::Cleared) => Ok(None),
            Some(Retirement::Removed) | None => {
                Self::remove_locked(&mut endpoints, &endpoint.sid).map(Some)
            }
        }
    }

    /// Drop an endpoint whose transport failed. Missing ids are ignored.
    pub async fn evict(&self, sid: &SessionId) -> Option<Endpoint> {
        let removed = self.endpoints.write().await.remove(sid);
        if let Some(ref endpoint) = removed {
            endpoint.retire(Retirement::Evicted);
        }
        removed
    }

    /// Retire every endpoint, returning how many were live.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Endpoint> = self.endpoints.write().await.drain().map(|(_, e)| e).collect();
        for endpoint in &drained {
            endpoint.retire(Retirement::Cleared);
        }
        drained.len()
    }

    pub async fn size(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn contains(&self, sid: &SessionId) -> bool {
        self.endpoints.read().await.contains_key(sid)
    }

    /// Stable copy of the pool in join order.
    pub async fn snapshot(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.endpoints.read().await.values().cloned().collect();
        endpoints.sort_by_key(|e| e.seq);
        endpoints
    }

    fn remove_locked(
        endpoints: &mut HashMap<SessionId, Endpoint>,
        sid: &SessionId,
    ) -> Result<Endpoint> {
        let before = endpoints.len();
        let removed = endpoints.remove(sid);
        let after = endpoints.len();

        match removed {
            Some(endpoint) if after + 1 == before => {
                endpoint.retire(Retirement::Removed);
                Ok(endpoint)
            }
            _ => Err(ConduitError::PoolInvariantViolation {
                session_id: sid.clone(),
                before,
                after,
            }),
        }
    }
}

//! The duplex broadcast unit.
//!
//! Inbound payloads (from endpoints or any other producer) are queued on the
//! outbound side for a single reader, typically a persistence feed. Fan-out is
//! a separate step: whoever consumes the outbound side decides when to
//! [`Conduit::stash`] and [`Conduit::send`].

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConduitError, Result};
use crate::payload::Payload;
use crate::pool::{ConnectionPool, Endpoint, Outbox};
use crate::session::{RandomSessionIds, SessionIdGenerator};
use crate::stash::{DEFAULT_REPLAY_INTERVAL, ReplayStash};

/// Tunables for a [`Conduit`].
#[derive(Clone, Debug)]
pub struct ConduitOptions {
    /// Spacing between stashed payloads replayed to a new endpoint.
    pub replay_interval: Duration,
}

impl Default for ConduitOptions {
    fn default() -> Self {
        Self {
            replay_interval: DEFAULT_REPLAY_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConduitState {
    Open,
    Closed,
}

/// Result of registering a connection.
#[derive(Debug)]
pub struct Registration {
    pub endpoint: Endpoint,
    /// Number of stashed payloads scheduled for replay.
    pub replaying: usize,
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// The outbound side of a conduit. Yields accepted payloads in receipt order
/// and `None` once the conduit has ended and the queue is drained.
pub struct ConduitReader {
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl ConduitReader {
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

impl Stream for ConduitReader {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        self.rx.poll_recv(cx)
    }
}

pub struct Conduit {
    pool: ConnectionPool,
    stash: ReplayStash,
    options: ConduitOptions,
    inbound: RwLock<Option<mpsc::UnboundedSender<Payload>>>,
    reader: Mutex<Option<ConduitReader>>,
    /// Serializes joining (pool insert + stash snapshot) against stash-then-fan-out.
    admission: Mutex<()>,
    ending: AtomicBool,
    closed: CancellationToken,
}

impl Conduit {
    pub fn new(options: ConduitOptions) -> Self {
        Self::with_generator(options, Arc::new(RandomSessionIds))
    }

    pub fn with_generator(options: ConduitOptions, ids: Arc<dyn SessionIdGenerator>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool: ConnectionPool::with_generator(ids),
            stash: ReplayStash::new(),
            options,
            inbound: RwLock::new(Some(tx)),
            reader: Mutex::new(Some(ConduitReader { rx })),
            admission: Mutex::new(()),
            ending: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConduitState {
        if self.closed.is_cancelled() {
            ConduitState::Closed
        } else {
            ConduitState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`end`](Self::end) has run.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// A token that fires when the conduit ends, for wiring into a listener's
    /// shutdown. Cancelling it does not end the conduit.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Register a new connection: handshake now, stashed history shortly after.
    pub async fn connect(&self, outbox: Outbox) -> Result<Registration> {
        if self.is_closed() {
            return Err(ConduitError::Closed);
        }

        let _admission = self.admission.lock().await;
        let endpoint = self.pool.add(outbox).await?;

        // `end` may have cleared the pool between the check above and the insert
        if self.is_closed() {
            self.pool.evict(endpoint.session_id()).await;
            return Err(ConduitError::Closed);
        }

        let replaying = self
            .stash
            .drain_to(endpoint.clone(), self.options.replay_interval)
            .await
            .map(|replay| replay.scheduled)
            .unwrap_or(0);

        let pool = self.pool.size().await;
        info!(
            sid = %endpoint.session_id(),
            pool,
            replaying,
            "endpoint registered"
        );
        Ok(Registration {
            endpoint,
            replaying,
        })
    }

    /// Unregister a closed connection.
    ///
    /// A [`ConduitError::PoolInvariantViolation`] here means the pool is
    /// corrupt; callers must not carry on.
    pub async fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        match self.pool.release(endpoint).await? {
            Some(_) => {
                let pool = self.pool.size().await;
                info!(sid = %endpoint.session_id(), pool, "endpoint removed");
            }
            None => debug!(sid = %endpoint.session_id(), "endpoint already retired"),
        }
        Ok(())
    }

    /// Accept a payload onto the outbound side.
    pub async fn write(&self, payload: Payload) -> Result<()> {
        let inbound = self.inbound.read().await;
        let tx = inbound.as_ref().ok_or(ConduitError::Closed)?;
        tx.send(payload).map_err(|_| ConduitError::Closed)
    }

    /// Hand out the outbound side. Only the first caller gets it.
    pub async fn take_reader(&self) -> Option<ConduitReader> {
        self.reader.lock().await.take()
    }

    /// Deliver `payload` to every endpoint in the current pool snapshot.
    ///
    /// Best effort: an endpoint whose transport fails is evicted and the
    /// fan-out continues with the rest.
    pub async fn send(&self, payload: Payload) -> Delivery {
        let targets = self.pool.snapshot().await;
        let mut delivery = Delivery {
            attempted: targets.len(),
            ..Default::default()
        };

        for endpoint in &targets {
            match endpoint.send(payload.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!("{}, dropping it from the pool", e);
                    delivery.failed += 1;
                    self.pool.evict(endpoint.session_id()).await;
                }
            }
        }

        debug!(
            attempted = delivery.attempted,
            failed = delivery.failed,
            bytes = payload.len(),
            "broadcast"
        );
        delivery
    }

    /// Keep `payload` for replay to endpoints that join later.
    pub async fn stash(&self, payload: Payload) {
        self.stash.append(payload).await;
    }

    /// Stash `payload` and fan it out as one step.
    ///
    /// An endpoint joining concurrently gets the payload exactly once: either
    /// live from this fan-out or from its replay, never both.
    pub async fn stash_and_send(&self, payload: Payload) -> Delivery {
        let _admission = self.admission.lock().await;
        self.stash.append(payload.clone()).await;
        self.send(payload).await
    }

    /// Optionally broadcast a final payload, then close for good.
    ///
    /// Stops accepting connections and writes, ends the outbound side once it
    /// drains, and retires every endpoint. Replays already in flight see their
    /// endpoint retired and stop.
    pub async fn end(&self, final_payload: Option<Payload>) {
        if self.ending.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(payload) = final_payload {
            self.send(payload).await;
        }

        self.closed.cancel();
        self.inbound.write().await.take();
        let retired = self.pool.clear().await;
        info!(retired, "conduit closed");
    }

    pub async fn pool_size(&self) -> usize {
        self.pool.size().await
    }

    pub async fn stash_len(&self) -> usize {
        self.stash.len().await
    }

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.pool.snapshot().await
    }
}

impl Default for Conduit {
    fn default() -> Self {
        Self::new(ConduitOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{OutboxReceiver, outbox};
    use crate::session::{SequentialSessionIds, SessionId};
    use futures::StreamExt;

    fn conduit() -> Conduit {
        Conduit::with_generator(
            ConduitOptions::default(),
            Arc::new(SequentialSessionIds::new("x")),
        )
    }

    async fn join(conduit: &Conduit) -> (Endpoint, OutboxReceiver) {
        let (tx, rx) = outbox();
        let registration = conduit.connect(tx).await.unwrap();
        (registration.endpoint, rx)
    }

    fn handshake(sid: &str) -> Payload {
        Payload::Text(format!(r#"{{"sid":"{}"}}"#, sid))
    }

    #[tokio::test(start_paused = true)]
    async fn chat_scenario() {
        let conduit = conduit();

        let (a, mut a_rx) = join(&conduit).await;
        assert_eq!(a_rx.recv().await.unwrap(), handshake("x1"));

        conduit.stash(Payload::from("hello")).await;
        let delivery = conduit.send(Payload::from("hello")).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(a_rx.recv().await.unwrap(), Payload::from("hello"));

        let (tx, mut b_rx) = outbox();
        let registration = conduit.connect(tx).await.unwrap();
        assert_eq!(registration.replaying, 1);
        assert_eq!(b_rx.recv().await.unwrap(), handshake("x2"));
        assert_eq!(b_rx.recv().await.unwrap(), Payload::from("hello"));

        conduit.disconnect(&a).await.unwrap();
        assert_eq!(conduit.pool_size().await, 1);
        let remaining = conduit.endpoints().await;
        assert_eq!(remaining[0].session_id().as_str(), "x2");

        let delivery = conduit.send(Payload::from("world")).await;
        assert_eq!(delivery.attempted, 1);
        assert_eq!(b_rx.recv().await.unwrap(), Payload::from("world"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fan_out_hits_every_endpoint_once() {
        let conduit = conduit();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (_, mut rx) = join(&conduit).await;
            rx.recv().await.unwrap();
            receivers.push(rx);
        }

        let payload = Payload::Binary(vec![0, 159, 146, 150]);
        let delivery = conduit.send(payload.clone()).await;
        assert_eq!(
            delivery,
            Delivery {
                attempted: 4,
                delivered: 4,
                failed: 0
            }
        );
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), payload);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn dead_endpoint_does_not_stop_fan_out() {
        let conduit = conduit();
        let (_a, mut a_rx) = join(&conduit).await;
        let (b, b_rx) = join(&conduit).await;
        let (_c, mut c_rx) = join(&conduit).await;
        a_rx.recv().await.unwrap();
        c_rx.recv().await.unwrap();
        drop(b_rx);

        let delivery = conduit.send(Payload::from("ping")).await;
        assert_eq!(delivery.attempted, 3);
        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.failed, 1);
        assert_eq!(a_rx.recv().await.unwrap(), Payload::from("ping"));
        assert_eq!(c_rx.recv().await.unwrap(), Payload::from("ping"));

        // Evicted, and its eventual close event is harmless
        assert_eq!(conduit.pool_size().await, 2);
        assert!(b.is_retired());
        conduit.disconnect(&b).await.unwrap();
        assert_eq!(conduit.pool_size().await, 2);
    }

    #[tokio::test]
    async fn repeated_disconnect_violates_invariant() {
        let conduit = conduit();
        let (a, _a_rx) = join(&conduit).await;
        let (_b, _b_rx) = join(&conduit).await;

        conduit.disconnect(&a).await.unwrap();
        let err = conduit.disconnect(&a).await.unwrap_err();
        assert_eq!(
            err,
            ConduitError::PoolInvariantViolation {
                session_id: SessionId::from("x1"),
                before: 1,
                after: 1,
            }
        );
        assert_eq!(conduit.pool_size().await, 1);
    }

    #[tokio::test]
    async fn writes_reach_the_single_reader_in_order() {
        let conduit = conduit();
        let mut reader = conduit.take_reader().await.unwrap();
        assert!(conduit.take_reader().await.is_none());

        for msg in ["one", "two", "three"] {
            conduit.write(Payload::from(msg)).await.unwrap();
        }
        assert_eq!(reader.recv().await.unwrap(), Payload::from("one"));
        assert_eq!(reader.next().await.unwrap(), Payload::from("two"));
        assert_eq!(reader.recv().await.unwrap(), Payload::from("three"));
    }

    #[tokio::test]
    async fn write_does_not_broadcast_by_itself() {
        let conduit = conduit();
        let (_a, mut a_rx) = join(&conduit).await;
        a_rx.recv().await.unwrap();

        conduit.write(Payload::from("queued")).await.unwrap();
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_closes_everything() {
        let conduit = conduit();
        let mut reader = conduit.take_reader().await.unwrap();
        let (a, mut a_rx) = join(&conduit).await;
        a_rx.recv().await.unwrap();
        conduit.write(Payload::from("before")).await.unwrap();

        conduit.end(Some(Payload::from("bye"))).await;

        assert_eq!(conduit.state(), ConduitState::Closed);
        assert_eq!(a_rx.recv().await.unwrap(), Payload::from("bye"));
        assert!(a.is_retired());
        assert_eq!(conduit.pool_size().await, 0);

        // Queued payloads drain, then the reader ends
        assert_eq!(reader.recv().await.unwrap(), Payload::from("before"));
        assert!(reader.recv().await.is_none());

        assert_eq!(
            conduit.write(Payload::from("after")).await,
            Err(ConduitError::Closed)
        );
        let (tx, _rx) = outbox();
        assert!(matches!(
            conduit.connect(tx).await,
            Err(ConduitError::Closed)
        ));

        // Closing again is a no-op, and the close event for `a` is harmless
        conduit.end(None).await;
        conduit.disconnect(&a).await.unwrap();
    }

    #[tokio::test]
    async fn closed_token_fires_on_end() {
        let conduit = Arc::new(conduit());
        let token = conduit.closed_token();
        assert!(!token.is_cancelled());

        let waiter = {
            let conduit = conduit.clone();
            tokio::spawn(async move { conduit.closed().await })
        };
        conduit.end(None).await;
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_precedes_replay() {
        let conduit = conduit();
        for item in ["a", "b", "c"] {
            conduit.stash(Payload::from(item)).await;
        }

        let (_e, mut rx) = join(&conduit).await;
        assert_eq!(rx.recv().await.unwrap(), handshake("x1"));
        assert_eq!(rx.recv().await.unwrap(), Payload::from("a"));
        assert_eq!(rx.recv().await.unwrap(), Payload::from("b"));
        assert_eq!(rx.recv().await.unwrap(), Payload::from("c"));
    }

    #[tokio::test]
    async fn concurrent_end_broadcasts_final_payload_once() {
        let conduit = Arc::new(conduit());
        let (_a, mut a_rx) = join(&conduit).await;
        a_rx.recv().await.unwrap();

        let first = {
            let conduit = conduit.clone();
            tokio::spawn(async move { conduit.end(Some(Payload::from("bye"))).await })
        };
        let second = {
            let conduit = conduit.clone();
            tokio::spawn(async move { conduit.end(Some(Payload::from("bye"))).await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap(), Payload::from("bye"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operations_run_on_spawned_tasks() {
        let conduit = Arc::new(conduit());
        let (tx, mut rx) = outbox();

        let registration = {
            let conduit = conduit.clone();
            tokio::spawn(async move { conduit.connect(tx).await })
                .await
                .unwrap()
                .unwrap()
        };
        assert_eq!(rx.recv().await.unwrap(), handshake("x1"));

        let delivery = {
            let conduit = conduit.clone();
            tokio::spawn(async move { conduit.stash_and_send(Payload::from("hi")).await })
                .await
                .unwrap()
        };
        assert_eq!(delivery.delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), Payload::from("hi"));

        let endpoint = registration.endpoint;
        let conduit2 = conduit.clone();
        tokio::spawn(async move { conduit2.disconnect(&endpoint).await })
            .await
            .unwrap()
            .unwrap();
        tokio::spawn(async move { conduit.end(None).await })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joiners_get_each_payload_once_while_broadcasting() {
        const PAYLOADS: usize = 50;
        const JOINERS: usize = 20;

        let conduit = Arc::new(Conduit::with_generator(
            ConduitOptions {
                replay_interval: Duration::from_micros(100),
            },
            Arc::new(SequentialSessionIds::new("x")),
        ));

        let producer = {
            let conduit = conduit.clone();
            tokio::spawn(async move {
                for n in 0..PAYLOADS {
                    conduit.stash_and_send(Payload::Text(n.to_string())).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut joiners = Vec::new();
        for _ in 0..JOINERS {
            let conduit = conduit.clone();
            joiners.push(tokio::spawn(async move {
                let (tx, mut rx) = outbox();
                conduit.connect(tx).await.unwrap();
                let first = rx.recv().await.unwrap();
                assert!(matches!(first, Payload::Text(ref t) if t.contains("sid")));
                rx
            }));
            tokio::task::yield_now().await;
        }

        let mut receivers = Vec::new();
        for joiner in joiners {
            receivers.push(joiner.await.unwrap());
        }
        producer.await.unwrap();

        for mut rx in receivers {
            let mut seen = Vec::new();
            while seen.len() < PAYLOADS {
                let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("payload never arrived")
                    .unwrap();
                match payload {
                    Payload::Text(t) => seen.push(t.parse::<usize>().unwrap()),
                    other => panic!("unexpected payload: {:?}", other),
                }
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..PAYLOADS).collect::<Vec<_>>());

            // Nothing delivered twice
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(rx.try_recv().is_err());
        }
    }
}

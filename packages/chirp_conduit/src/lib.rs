//! Chirp Conduit - fan-out core of the Chirp broadcaster
//!
//! Owns the set of connected endpoints, hands each a session id, replays
//! stashed history to late joiners and relays payloads to every live peer.
//! It knows nothing about HTTP or sockets: a connection is represented by an
//! [`Outbox`] whose receiving half the caller pumps into its transport.
//!
//! # Example
//!
//! ```no_run
//! use chirp_conduit::{Conduit, ConduitOptions, Payload, outbox};
//!
//! #[tokio::main]
//! async fn main() {
//!     let conduit = Conduit::new(ConduitOptions::default());
//!     let mut reader = conduit.take_reader().await.unwrap();
//!
//!     let (tx, mut rx) = outbox();
//!     let registration = conduit.connect(tx).await.unwrap();
//!     println!("handshake: {:?}", rx.recv().await);
//!
//!     // Something arrives from a peer...
//!     conduit.write(Payload::from("hello")).await.unwrap();
//!
//!     // ...and the reader decides to keep and relay it.
//!     while let Some(payload) = reader.recv().await {
//!         conduit.stash(payload.clone()).await;
//!         conduit.send(payload).await;
//!     }
//!
//!     conduit.disconnect(&registration.endpoint).await.unwrap();
//! }
//! ```

pub mod conduit;
mod error;
mod payload;
pub mod pool;
pub mod session;
pub mod stash;

pub use conduit::{Conduit, ConduitOptions, ConduitReader, ConduitState, Delivery, Registration};
pub use error::{ConduitError, Result};
pub use payload::Payload;
pub use pool::{ConnectionPool, Endpoint, Outbox, OutboxReceiver, Retirement, outbox};
pub use session::{RandomSessionIds, SequentialSessionIds, SessionId, SessionIdGenerator};
pub use stash::{DEFAULT_REPLAY_INTERVAL, Replay, ReplayStash};

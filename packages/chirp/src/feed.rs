//! Message feed: the single reader of the conduit's outbound side.
//!
//! Every accepted payload is appended to the message store, kept in the
//! conduit's stash and fanned out to connected peers, in that order. On
//! startup the stored history is loaded back into the stash.

use anyhow::Result;
use chirp_conduit::{Conduit, ConduitReader, Payload};
use std::sync::Arc;
use tracing::{error, info};

use crate::db::Database;
use crate::metrics::ServerMetrics;

pub struct Feed {
    conduit: Arc<Conduit>,
    db: Option<Arc<Database>>,
    metrics: Arc<ServerMetrics>,
}

impl Feed {
    pub fn new(
        conduit: Arc<Conduit>,
        db: Option<Arc<Database>>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            conduit,
            db,
            metrics,
        }
    }

    /// Load stored history into the stash, oldest first.
    pub async fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let messages = db.all_messages().await?;
        let count = messages.len();
        for message in messages {
            self.conduit.stash(message.payload).await;
        }
        info!("Restored {} stored messages into the stash", count);
        Ok(count)
    }

    /// Consume the outbound side until the conduit ends.
    pub async fn run(self, mut reader: ConduitReader) {
        while let Some(payload) = reader.recv().await {
            self.publish(payload).await;
        }
        info!("Feed drained, conduit closed");
    }

    async fn publish(&self, payload: Payload) {
        if let Some(db) = &self.db {
            // Not durable: a failed write still reaches the live peers
            if let Err(e) = db.insert_message(&payload).await {
                error!("Failed to persist message: {:#}", e);
                self.metrics.feed_error();
            }
        }
        let delivery = self.conduit.stash_and_send(payload).await;
        self.metrics.broadcast(&delivery);
    }
}

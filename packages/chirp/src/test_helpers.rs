use std::sync::Arc;
use std::time::Duration;

use chirp_conduit::{Conduit, ConduitOptions, SequentialSessionIds};

use crate::AppState;
use crate::db::Database;
use crate::metrics::ServerMetrics;

/// Build an `AppState` with deterministic session ids (`x1`, `x2`, ...), a
/// short replay interval and an in-memory message store.
pub async fn test_app_state() -> AppState {
    let conduit = Arc::new(Conduit::with_generator(
        ConduitOptions {
            replay_interval: Duration::from_millis(10),
        },
        Arc::new(SequentialSessionIds::new("x")),
    ));
    let db = Database::in_memory().await.expect("in-memory sqlite");

    AppState {
        conduit,
        metrics: Arc::new(ServerMetrics::new()),
        db: Some(Arc::new(db)),
    }
}

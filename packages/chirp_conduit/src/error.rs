use crate::session::SessionId;

/// Errors raised by the conduit and its connection pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConduitError {
    /// Removing an endpoint did not shrink the pool by exactly one.
    ///
    /// Means a duplicate session id or a double unregister. The pool can no
    /// longer be trusted, so callers must treat this as fatal.
    #[error(
        "pool invariant violated removing {session_id}: size went from {before} to {after}"
    )]
    PoolInvariantViolation {
        session_id: SessionId,
        before: usize,
        after: usize,
    },

    /// Every drawn session id collided with a live endpoint.
    #[error("no free session id after {attempts} attempts")]
    SessionIdExhausted { attempts: usize },

    /// The endpoint's transport is gone (receiver dropped or already retired).
    #[error("failed to send to endpoint {session_id}")]
    TransportSendFailure { session_id: SessionId },

    /// The conduit has been ended and no longer accepts work.
    #[error("conduit is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConduitError>;

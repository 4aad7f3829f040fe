use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error conditions that callers need to tell apart from generic failures.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A store was initialised by an indexer running against a different environment.
    #[error("{store} is locked to env {locked:?} but indexer is configured for {configured:?}")]
    EnvLockMismatch {
        store: &'static str,
        locked: String,
        configured: String,
    },

    /// Upstream returned no entities of a kind that must never be empty.
    #[error("refusing to write snapshot: RPC returned no {0} (possible RPC issue)")]
    RefusingEmptySnapshot(&'static str),
}

/// Whether any error in the chain is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)))
}

/// Runs `fut` unless `cancel` fires first, in which case [`Error::Cancelled`] is returned.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled.into()),
        res = fut => res,
    }
}

//! Secret store: where derived tokens are kept after `Hash`.
//!
//! A write is fire-and-complete: [`SecretStore::keep_secret`] returns at once
//! with a [`Completion`] that resolves exactly once when the backend has
//! acknowledged (or refused) the write. Callers bound the wait themselves.

pub mod memory;
pub mod null;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

pub use memory::MemoryStore;
pub use null::NullStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Reasons a store write did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend dropped the completion without reporting an outcome.
    #[error("store abandoned the write")]
    Abandoned,
    #[error("store write timed out")]
    TimedOut,
    #[error("store backend error: {0}")]
    Backend(String),
    /// Reported by a remote peer; the message is its description.
    #[error("{0}")]
    Remote(String),
}

/// Persistence collaborator for derived tokens.
pub trait SecretStore: Send + Sync + 'static {
    /// Start persisting `token`. The returned completion resolves once.
    fn keep_secret(&self, token: Vec<u8>) -> Completion;
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Sending half of a [`Completion`], held by the store backend.
pub type Completer = oneshot::Sender<Result<(), StoreError>>;

/// Single-value future resolving to the outcome of one store write.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), StoreError>>,
}

impl Completion {
    /// A pending completion and the handle that resolves it.
    pub fn channel() -> (Completer, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved.
    pub fn ready(result: Result<(), StoreError>) -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(result);
        completion
    }
}

impl Future for Completion {
    type Output = Result<(), StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoreError::Abandoned)))
    }
}

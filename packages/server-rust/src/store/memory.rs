//! In-process [`SecretStore`] backed by a `DashMap`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::{Completion, SecretStore};

/// Keeps every token in memory, keyed by insertion sequence.
///
/// Writes acknowledge immediately. Used by tests and when no database is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: DashMap<u64, Vec<u8>>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    #[must_use]
    pub fn contains(&self, token: &[u8]) -> bool {
        self.secrets.iter().any(|entry| entry.value().as_slice() == token)
    }
}

impl SecretStore for MemoryStore {
    fn keep_secret(&self, token: Vec<u8>) -> Completion {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.secrets.insert(seq, token);
        Completion::ready(Ok(()))
    }
}
